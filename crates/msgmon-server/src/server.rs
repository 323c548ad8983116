use std::sync::Arc;

use libmsgmon::{BroadcastPublisher, Router};
use tokio::net::UnixListener;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::connection;

/// Everything a connection needs: the router for commands and the broadcast
/// side of its publisher for subscriptions.
pub struct AppState {
    pub router: Router,
    pub events: Arc<BroadcastPublisher>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: &ServerConfig) -> anyhow::Result<SharedState> {
        let events = Arc::new(BroadcastPublisher::new(config.event_backlog));
        let router = Router::builder()
            .config(config.monitor.clone())
            .publisher(events.clone())
            .build()?;
        Ok(Arc::new(Self { router, events }))
    }
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    // Clean up stale socket
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }

    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pid_path = ServerConfig::pid_file_path();
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&pid_path, std::process::id().to_string())?;

    let state = AppState::new(&config)?;
    let listener = UnixListener::bind(&config.socket_path)?;
    info!(
        socket = %config.socket_path.display(),
        pid = std::process::id(),
        capacity = config.monitor.capacity,
        "msgmon server started"
    );

    let socket_path = config.socket_path.clone();
    let pid_path_clone = pid_path.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down...");
        let _ = std::fs::remove_file(&socket_path);
        let _ = std::fs::remove_file(&pid_path_clone);
        std::process::exit(0);
    });

    serve(listener, state).await
}

/// Accept connections until the listener fails irrecoverably.
pub async fn serve(listener: UnixListener, state: SharedState) -> anyhow::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    connection::handle_client(stream, state).await;
                });
            }
            Err(e) => {
                error!("accept error: {e}");
            }
        }
    }
}
