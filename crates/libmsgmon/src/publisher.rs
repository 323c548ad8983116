use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use msgmon_protocol::UpdateEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// Outbound seam for every update event the core produces.
///
/// Implementations must not block; a slow consumer has to buffer or shed on
/// its own side.
pub trait UpdatePublisher: Send + Sync {
    fn publish(&self, event: UpdateEvent);
}

/// Fans events out to any number of subscribers over a tokio broadcast
/// channel. A subscriber that falls behind loses the oldest events.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<UpdateEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl UpdatePublisher for BroadcastPublisher {
    fn publish(&self, event: UpdateEvent) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            trace!(kind = event.kind(), session_id = ?event.session_id(), "no subscribers");
        }
    }
}

/// Forwards events only while the session is being observed by a client.
pub struct ObservedPublisher {
    inner: Arc<dyn UpdatePublisher>,
    observed: Arc<AtomicBool>,
}

impl ObservedPublisher {
    pub fn new(inner: Arc<dyn UpdatePublisher>, observed: Arc<AtomicBool>) -> Self {
        Self { inner, observed }
    }
}

impl UpdatePublisher for ObservedPublisher {
    fn publish(&self, event: UpdateEvent) {
        if self.observed.load(Ordering::Acquire) {
            self.inner.publish(event);
        }
    }
}
