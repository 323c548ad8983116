use std::collections::BTreeSet;
use std::sync::Arc;

use libmsgmon::MonitorError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use msgmon_protocol::{DomainSessionId, ErrorCode, Request, Response, UpdateEvent};

use crate::server::SharedState;

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Sessions a client watches; read by its event forwarder.
type WatchSet = Arc<Mutex<BTreeSet<DomainSessionId>>>;

/// Per-client state: watched sessions and at most one live event
/// subscription.
#[derive(Default)]
struct ClientState {
    watched: WatchSet,
    subscription: Option<JoinHandle<()>>,
}

/// Handle a single client connection.
pub async fn handle_client(stream: UnixStream, state: SharedState) {
    let (reader, writer) = stream.into_split();
    let reader = BufReader::new(reader);
    let writer: SharedWriter = Arc::new(Mutex::new(writer));
    let mut client_state = ClientState::default();

    let mut lines = reader.lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("client disconnected");
                break;
            }
            Err(e) => {
                error!("read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let resp = Response::Error {
                    message: format!("invalid request: {e}"),
                    code: ErrorCode::InvalidRequest,
                };
                let mut w = writer.lock().await;
                let _ = write_response(&mut w, &resp).await;
                continue;
            }
        };

        let response = handle_request(request, &state, &writer, &mut client_state).await;

        let mut w = writer.lock().await;
        if let Err(e) = write_response(&mut w, &response).await {
            error!("write error: {e}");
            break;
        }
    }

    // Cleanup: stop forwarding, then release every session this client watched
    if let Some(task) = client_state.subscription.take() {
        task.abort();
    }
    let watched = std::mem::take(&mut *client_state.watched.lock().await);
    for session_id in watched {
        let _ = state.router.ignore_session(session_id);
    }
}

async fn handle_request(
    request: Request,
    state: &SharedState,
    writer: &SharedWriter,
    client_state: &mut ClientState,
) -> Response {
    let router = &state.router;
    match request {
        Request::MessageArrived { message } => {
            router.message_arrived(message).await;
            Response::Ok { data: None }
        }

        Request::SessionActive { session_id } => {
            let created = router.session_active(session_id);
            Response::Ok {
                data: Some(serde_json::json!({ "created": created })),
            }
        }

        Request::SessionInactive { session_id } => {
            let removed = router.session_inactive(session_id);
            Response::Ok {
                data: Some(serde_json::json!({ "removed": removed })),
            }
        }

        Request::ListSessions => {
            let sessions: Vec<_> = router
                .active_sessions()
                .into_iter()
                .map(|id| {
                    serde_json::json!({
                        "session_id": id,
                        "watchers": router.watchers(id),
                    })
                })
                .collect();
            Response::Ok {
                data: Some(serde_json::json!({ "sessions": sessions })),
            }
        }

        Request::MonitorSession { session_id } => {
            if client_state.watched.lock().await.insert(session_id) {
                let _ = router.monitor_session(session_id);
            }
            Response::Ok {
                data: Some(serde_json::json!({ "watchers": router.watchers(session_id) })),
            }
        }

        Request::IgnoreSession { session_id } => {
            if client_state.watched.lock().await.remove(&session_id) {
                let _ = router.ignore_session(session_id);
            }
            Response::Ok {
                data: Some(serde_json::json!({ "watchers": router.watchers(session_id) })),
            }
        }

        Request::SetListening {
            session_id,
            listening,
        } => ack(router.set_listening(session_id, listening).await),

        Request::SetAdvancedHeader {
            session_id,
            advanced_header,
        } => ack(router.set_advanced_header(session_id, advanced_header).await),

        Request::SetFilterChoices {
            session_id,
            choices,
        } => ack(router.set_filter_choices(session_id, choices).await),

        Request::AcceptAllChoices { session_id } => {
            ack(router.accept_all_choices(session_id).await)
        }

        Request::SetEntityFilter {
            session_id,
            entity_marking,
        } => ack(router.set_entity_filter(session_id, entity_marking).await),

        Request::Refresh { session_id } => ack(router.refresh(session_id).await),

        Request::GetDisplayData {
            session_id,
            metadata,
        } => match router.get_display_data(session_id, metadata).await {
            Ok(lookup) => Response::Ok {
                data: Some(serde_json::to_value(&lookup).unwrap_or_default()),
            },
            Err(e) => error_response(e),
        },

        Request::Subscribe => {
            if let Some(previous) = client_state.subscription.take() {
                previous.abort();
            }
            let rx = state.events.subscribe();
            let writer = Arc::clone(writer);
            let watched = Arc::clone(&client_state.watched);
            client_state.subscription = Some(tokio::spawn(async move {
                forward_events(rx, writer, watched).await;
            }));
            Response::Ok {
                data: Some(serde_json::json!({
                    "subscribers": state.events.subscriber_count(),
                })),
            }
        }
    }
}

fn ack(result: Result<(), MonitorError>) -> Response {
    match result {
        Ok(()) => Response::Ok { data: None },
        Err(e) => error_response(e),
    }
}

fn error_response(e: MonitorError) -> Response {
    let (code, message) = e.to_error_code();
    Response::Error { message, code }
}

/// Forward broadcast events to a client's write stream: global events
/// always, session events only for sessions the client watches.
async fn forward_events(
    mut rx: broadcast::Receiver<UpdateEvent>,
    writer: SharedWriter,
    watched: WatchSet,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Some(session_id) = event.session_id() {
                    if !watched.lock().await.contains(&session_id) {
                        continue;
                    }
                }
                let resp = Response::Event(event);
                let mut w = writer.lock().await;
                if write_response(&mut w, &resp).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "subscriber lagged");
                // The client can resynchronize with a refresh.
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("broadcast channel closed");
                break;
            }
        }
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &Response,
) -> Result<(), std::io::Error> {
    let json = serde_json::to_string(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
