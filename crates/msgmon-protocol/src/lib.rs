pub mod paths;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identifier of a domain session (a single tutoring/training run).
pub type DomainSessionId = i32;

/// Message types carried on the platform bus.
///
/// Ordered so that filter choice sets render in a stable order.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Ack,
    Nack,
    ProcessedAck,
    ProcessedNack,
    ModuleStatus,
    GatewayModuleStatus,
    KillModule,
    LoginRequest,
    LogoutRequest,
    InitializeDomainSessionRequest,
    StartDomainSession,
    CloseDomainSessionRequest,
    CourseState,
    LessonStarted,
    LessonCompleted,
    EntityState,
    WeaponFire,
    Detonation,
    Geolocation,
    LearnerState,
    PedagogicalRequest,
    ApplyStrategies,
    DisplayFeedbackGatewayRequest,
    EnvironmentControl,
    KnowledgeSessionCreated,
    SensorFilterData,
    Siman,
    StartResume,
    StopFreeze,
    SubmitSurveyResults,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Reuse the wire spelling so logs and clients agree.
        match serde_json::to_value(self) {
            Ok(serde_json::Value::String(s)) => f.write_str(&s),
            _ => write!(f, "{self:?}"),
        }
    }
}

/// An immutable message observed on the bus.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    /// Send time in epoch milliseconds.
    pub timestamp: i64,
    pub sequence_number: i64,
    pub sender_address: String,
    pub destination_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_session_id: Option<DomainSessionId>,
    #[serde(default)]
    pub needs_ack: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Message {
    /// Project this message onto its list entry / lookup key.
    pub fn metadata(&self) -> DisplayMetadata {
        DisplayMetadata {
            message_type: self.message_type,
            timestamp: self.timestamp,
            sequence_number: self.sequence_number,
            sender_address: self.sender_address.clone(),
        }
    }

    /// Entity marking carried by entity state payloads, if any.
    pub fn entity_marking(&self) -> Option<&str> {
        self.payload.get("entity_marking").and_then(|v| v.as_str())
    }
}

/// Lightweight projection of a [`Message`] used as a display list entry and
/// as the key into a log's reverse index.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct DisplayMetadata {
    pub message_type: MessageType,
    pub timestamp: i64,
    pub sequence_number: i64,
    pub sender_address: String,
}

impl From<&Message> for DisplayMetadata {
    fn from(message: &Message) -> Self {
        message.metadata()
    }
}

/// Extra routing details included when a log has the advanced header enabled.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AdvancedHeader {
    pub sender_address: String,
    pub destination_address: String,
    pub sequence_number: i64,
    pub needs_ack: bool,
}

/// Everything needed to render one message's detail panel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DisplayData {
    pub metadata: DisplayMetadata,
    pub domain_session_id: Option<DomainSessionId>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<AdvancedHeader>,
}

/// Result of a detail lookup. `NotFound` means the entry was evicted (or
/// filtered away) after the caller saw it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DisplayLookup {
    Found(DisplayData),
    NotFound,
}

impl DisplayLookup {
    pub fn is_found(&self) -> bool {
        matches!(self, DisplayLookup::Found(_))
    }
}

/// Update events emitted by session logs. `session_id` is `None` for the
/// global (system) log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateEvent {
    Received {
        session_id: Option<DomainSessionId>,
        metadata: DisplayMetadata,
    },
    Removed {
        session_id: Option<DomainSessionId>,
        metadata: DisplayMetadata,
    },
    Replaced {
        session_id: Option<DomainSessionId>,
        entries: Vec<DisplayMetadata>,
    },
    ListeningChanged {
        session_id: Option<DomainSessionId>,
        listening: bool,
    },
    HeaderChanged {
        session_id: Option<DomainSessionId>,
        advanced_header: bool,
    },
    ChoicesChanged {
        session_id: Option<DomainSessionId>,
        known: BTreeSet<MessageType>,
        selected: BTreeSet<MessageType>,
    },
}

impl UpdateEvent {
    /// The log the event originated from.
    pub fn session_id(&self) -> Option<DomainSessionId> {
        match self {
            UpdateEvent::Received { session_id, .. }
            | UpdateEvent::Removed { session_id, .. }
            | UpdateEvent::Replaced { session_id, .. }
            | UpdateEvent::ListeningChanged { session_id, .. }
            | UpdateEvent::HeaderChanged { session_id, .. }
            | UpdateEvent::ChoicesChanged { session_id, .. } => *session_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpdateEvent::Received { .. } => "received",
            UpdateEvent::Removed { .. } => "removed",
            UpdateEvent::Replaced { .. } => "replaced",
            UpdateEvent::ListeningChanged { .. } => "listening_changed",
            UpdateEvent::HeaderChanged { .. } => "header_changed",
            UpdateEvent::ChoicesChanged { .. } => "choices_changed",
        }
    }
}

/// Control-plane requests sent as JSON lines over the Unix socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    // Inbound traffic and lifecycle
    MessageArrived {
        message: Message,
    },
    SessionActive {
        session_id: DomainSessionId,
    },
    SessionInactive {
        session_id: DomainSessionId,
    },
    ListSessions,

    // Observation
    MonitorSession {
        session_id: DomainSessionId,
    },
    IgnoreSession {
        session_id: DomainSessionId,
    },

    // Per-log administration; a missing session_id targets the global log
    SetListening {
        #[serde(default)]
        session_id: Option<DomainSessionId>,
        listening: bool,
    },
    SetAdvancedHeader {
        #[serde(default)]
        session_id: Option<DomainSessionId>,
        advanced_header: bool,
    },
    SetFilterChoices {
        #[serde(default)]
        session_id: Option<DomainSessionId>,
        choices: BTreeSet<MessageType>,
    },
    AcceptAllChoices {
        #[serde(default)]
        session_id: Option<DomainSessionId>,
    },
    SetEntityFilter {
        session_id: DomainSessionId,
        #[serde(default)]
        entity_marking: String,
    },
    Refresh {
        #[serde(default)]
        session_id: Option<DomainSessionId>,
    },
    GetDisplayData {
        #[serde(default)]
        session_id: Option<DomainSessionId>,
        metadata: DisplayMetadata,
    },

    // Event streaming
    Subscribe,
}

/// Server-to-client responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
    Event(UpdateEvent),
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownSession,
    InvalidRequest,
    InvalidConfig,
    ServerError,
}
