use std::path::{Path, PathBuf};

use libmsgmon::MonitorConfig;
use msgmon_protocol::paths;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "paths::default_socket_path")]
    pub socket_path: PathBuf,
    /// Per-connection event backlog before a slow subscriber starts losing
    /// the oldest events.
    #[serde(default = "default_event_backlog")]
    pub event_backlog: usize,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&paths::config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let mut config: Self = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            Self::default()
        };
        config.override_socket(std::env::var("MSGMON_SOCKET").ok());
        Ok(config)
    }

    /// The environment wins over whatever the file says.
    fn override_socket(&mut self, socket: Option<String>) {
        if let Some(socket) = socket.filter(|s| !s.is_empty()) {
            self.socket_path = PathBuf::from(socket);
        }
    }

    pub fn pid_file_path() -> PathBuf {
        paths::pid_file_path()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: paths::default_socket_path(),
            event_backlog: default_event_backlog(),
            monitor: MonitorConfig::default(),
        }
    }
}

fn default_event_backlog() -> usize {
    4_096
}
