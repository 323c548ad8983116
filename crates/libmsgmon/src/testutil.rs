//! Shared helpers for unit tests.

use std::sync::Mutex;

use msgmon_protocol::{DisplayMetadata, Message, MessageType, UpdateEvent};

use crate::publisher::UpdatePublisher;

/// Publisher that keeps every event for later inspection.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<UpdateEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<UpdateEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<UpdateEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(UpdateEvent::kind).collect()
    }
}

impl UpdatePublisher for RecordingPublisher {
    fn publish(&self, event: UpdateEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// A message of `message_type` with a unique sequence number.
pub fn message(message_type: MessageType, session: Option<i32>, seq: i64) -> Message {
    Message {
        message_type,
        timestamp: 1_700_000_000_000 + seq,
        sequence_number: seq,
        sender_address: "Domain_Queue".to_string(),
        destination_address: "Monitor_Topic".to_string(),
        domain_session_id: session,
        needs_ack: seq % 2 == 0,
        payload: serde_json::json!({"seq": seq}),
    }
}

pub fn metas(messages: &[&Message]) -> Vec<DisplayMetadata> {
    messages.iter().map(|m| m.metadata()).collect()
}
