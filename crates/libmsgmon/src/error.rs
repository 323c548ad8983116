use msgmon_protocol::{DomainSessionId, ErrorCode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("unknown session: {0}")]
    UnknownSession(DomainSessionId),

    #[error("system log is not running")]
    SystemLogClosed,

    #[error("router requires an update publisher")]
    MissingPublisher,

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl MonitorError {
    /// Build the "no such log" error for a scope; the system log is never
    /// unknown, only closed.
    pub(crate) fn missing_log(session_id: Option<DomainSessionId>) -> Self {
        match session_id {
            Some(id) => MonitorError::UnknownSession(id),
            None => MonitorError::SystemLogClosed,
        }
    }

    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            MonitorError::UnknownSession(_) => (ErrorCode::UnknownSession, self.to_string()),
            MonitorError::SystemLogClosed => (ErrorCode::ServerError, self.to_string()),
            MonitorError::MissingPublisher | MonitorError::InvalidConfig(_) => {
                (ErrorCode::InvalidConfig, self.to_string())
            }
        }
    }
}
