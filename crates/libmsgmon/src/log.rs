//! Per-session message log.
//!
//! [`SessionLog`] is the plain state machine: bounded history, filtered
//! display list and reverse index. [`LogHandle`] runs one `SessionLog` as an
//! actor so every operation against a log is linearized through a single
//! command queue and no locking is needed around the three structures.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use msgmon_protocol::{
    AdvancedHeader, DisplayData, DisplayLookup, DisplayMetadata, DomainSessionId, Message,
    MessageType, UpdateEvent,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::buffer::BoundedBuffer;
use crate::error::MonitorError;
use crate::filter::{FilterListener, FilterNotice, MessageFilter};
use crate::publisher::UpdatePublisher;

#[derive(Debug)]
struct IndexEntry {
    message: Arc<Message>,
    /// Number of display entries sharing this metadata.
    refs: usize,
}

/// Publishes the filter's choice updates on behalf of the owning log.
struct ChoicesPublisher {
    session_id: Arc<OnceLock<DomainSessionId>>,
    publisher: Arc<dyn UpdatePublisher>,
}

impl FilterListener for ChoicesPublisher {
    fn choices_changed(
        &self,
        known: &BTreeSet<MessageType>,
        selected: &BTreeSet<MessageType>,
    ) -> anyhow::Result<()> {
        self.publisher.publish(UpdateEvent::ChoicesChanged {
            session_id: self.session_id.get().copied(),
            known: known.clone(),
            selected: selected.clone(),
        });
        Ok(())
    }
}

/// Point-in-time copy of a log's state.
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    pub session_id: Option<DomainSessionId>,
    pub capacity: usize,
    pub history: Vec<Arc<Message>>,
    pub display: Vec<DisplayMetadata>,
    pub index_keys: Vec<DisplayMetadata>,
    pub known_choices: BTreeSet<MessageType>,
    pub selected_choices: BTreeSet<MessageType>,
    pub entity_marking: Option<String>,
    pub listening: bool,
    pub advanced_header: bool,
}

/// Bounded history, filtered display list and reverse index for one session
/// (or for system traffic when the session id is absent).
pub struct SessionLog {
    session_id: Arc<OnceLock<DomainSessionId>>,
    history: BoundedBuffer<Arc<Message>>,
    display: BoundedBuffer<DisplayMetadata>,
    index: HashMap<DisplayMetadata, IndexEntry>,
    filter: MessageFilter,
    listening: bool,
    advanced_header: bool,
    publisher: Arc<dyn UpdatePublisher>,
}

impl SessionLog {
    pub fn new(
        session_id: Option<DomainSessionId>,
        mut filter: MessageFilter,
        capacity: usize,
        publisher: Arc<dyn UpdatePublisher>,
    ) -> Self {
        let cell = Arc::new(OnceLock::new());
        if let Some(id) = session_id {
            let _ = cell.set(id);
        }
        filter.add_listener(Arc::new(ChoicesPublisher {
            session_id: cell.clone(),
            publisher: publisher.clone(),
        }));

        Self {
            session_id: cell,
            history: BoundedBuffer::new(capacity),
            display: BoundedBuffer::new(capacity),
            index: HashMap::new(),
            filter,
            listening: true,
            advanced_header: false,
            publisher,
        }
    }

    /// Log for traffic that belongs to no domain session.
    pub fn system(capacity: usize, publisher: Arc<dyn UpdatePublisher>) -> Self {
        Self::new(None, MessageFilter::system(), capacity, publisher)
    }

    pub fn domain_session(
        session_id: DomainSessionId,
        capacity: usize,
        publisher: Arc<dyn UpdatePublisher>,
    ) -> Self {
        Self::new(
            Some(session_id),
            MessageFilter::domain_session(),
            capacity,
            publisher,
        )
    }

    pub fn session_id(&self) -> Option<DomainSessionId> {
        self.session_id.get().copied()
    }

    /// Capture `message` and, while listening, update the display list.
    pub fn post_message(&mut self, message: Arc<Message>) {
        if let Some(id) = message.domain_session_id {
            if self.filter.scope().in_scope(&message) {
                let _ = self.session_id.set(id);
            }
        }

        let _ = self.history.push(message.clone());

        if !self.listening {
            return;
        }

        if self.filter.accept(&message) {
            self.append_display(message);
        }
    }

    fn append_display(&mut self, message: Arc<Message>) {
        let metadata = message.metadata();

        if let Some(evicted) = self.display.evict_if_full() {
            unindex(&mut self.index, &evicted);
            self.publish(UpdateEvent::Removed {
                session_id: self.session_id(),
                metadata: evicted,
            });
        }

        index(&mut self.index, metadata.clone(), message);
        let _ = self.display.push(metadata.clone());
        self.publish(UpdateEvent::Received {
            session_id: self.session_id(),
            metadata,
        });
    }

    /// Replay the whole history through the current filter and publish the
    /// result as a single replacement.
    pub fn rebuild_display_list(&mut self) {
        self.display.clear();
        self.index.clear();

        // The display list never outgrows the history it is derived from, so
        // nothing is evicted here.
        for message in self.history.iter() {
            if self.filter.accept(message) {
                let metadata = message.metadata();
                index(&mut self.index, metadata.clone(), message.clone());
                let _ = self.display.push(metadata);
            }
        }

        debug!(
            session_id = ?self.session_id(),
            history = self.history.len(),
            display = self.display.len(),
            "display list rebuilt"
        );
        self.publish_replaced();
    }

    pub fn get_display_data(&self, metadata: &DisplayMetadata) -> DisplayLookup {
        let Some(entry) = self.index.get(metadata) else {
            return DisplayLookup::NotFound;
        };
        let message = &entry.message;
        let header = self.advanced_header.then(|| AdvancedHeader {
            sender_address: message.sender_address.clone(),
            destination_address: message.destination_address.clone(),
            sequence_number: message.sequence_number,
            needs_ack: message.needs_ack,
        });

        DisplayLookup::Found(DisplayData {
            metadata: metadata.clone(),
            domain_session_id: message.domain_session_id,
            payload: message.payload.clone(),
            header,
        })
    }

    /// Toggle live display updates. Resuming rebuilds the display list,
    /// since history kept evicting while it was frozen.
    pub fn set_listening(&mut self, listening: bool) {
        let resumed = listening && !self.listening;
        self.listening = listening;
        if resumed {
            self.rebuild_display_list();
        }
        self.publish_listening();
    }

    pub fn set_advanced_header(&mut self, advanced_header: bool) {
        self.advanced_header = advanced_header;
        self.publish_header();
    }

    pub fn set_filter_choices(&mut self, choices: BTreeSet<MessageType>) {
        let notice = self.filter.set_selected_choices(choices);
        self.apply(notice);
    }

    pub fn accept_all_choices(&mut self) {
        let notice = self.filter.accept_all_choices();
        self.apply(notice);
    }

    pub fn set_entity_filter(&mut self, entity_marking: &str) {
        let notice = self.filter.set_sub_field_predicate(entity_marking);
        self.apply(notice);
    }

    pub fn add_filter_listener(&mut self, listener: Arc<dyn FilterListener>) {
        self.filter.add_listener(listener);
    }

    pub fn remove_filter_listener(&mut self, listener: &Arc<dyn FilterListener>) {
        self.filter.remove_listener(listener);
    }

    /// Resynchronize a reconnecting observer.
    pub fn refresh(&self) {
        self.publish(UpdateEvent::ChoicesChanged {
            session_id: self.session_id(),
            known: self.filter.known_choices().clone(),
            selected: self.filter.selected_choices().clone(),
        });
        self.publish_replaced();
        self.publish_listening();
        self.publish_header();
    }

    pub fn snapshot(&self) -> LogSnapshot {
        LogSnapshot {
            session_id: self.session_id(),
            capacity: self.history.capacity(),
            history: self.history.to_vec(),
            display: self.display.to_vec(),
            index_keys: self.index.keys().cloned().collect(),
            known_choices: self.filter.known_choices().clone(),
            selected_choices: self.filter.selected_choices().clone(),
            entity_marking: self.filter.entity_marking().map(str::to_string),
            listening: self.listening,
            advanced_header: self.advanced_header,
        }
    }

    fn apply(&mut self, notice: FilterNotice) {
        if notice.filter_changed {
            self.rebuild_display_list();
        }
    }

    fn publish(&self, event: UpdateEvent) {
        self.publisher.publish(event);
    }

    fn publish_replaced(&self) {
        self.publish(UpdateEvent::Replaced {
            session_id: self.session_id(),
            entries: self.display.to_vec(),
        });
    }

    fn publish_listening(&self) {
        self.publish(UpdateEvent::ListeningChanged {
            session_id: self.session_id(),
            listening: self.listening,
        });
    }

    fn publish_header(&self) {
        self.publish(UpdateEvent::HeaderChanged {
            session_id: self.session_id(),
            advanced_header: self.advanced_header,
        });
    }
}

fn index(
    index: &mut HashMap<DisplayMetadata, IndexEntry>,
    metadata: DisplayMetadata,
    message: Arc<Message>,
) {
    index
        .entry(metadata)
        .and_modify(|entry| {
            entry.message = message.clone();
            entry.refs += 1;
        })
        .or_insert(IndexEntry { message, refs: 1 });
}

fn unindex(index: &mut HashMap<DisplayMetadata, IndexEntry>, metadata: &DisplayMetadata) {
    if let Some(entry) = index.get_mut(metadata) {
        entry.refs -= 1;
        if entry.refs == 0 {
            let _ = index.remove(metadata);
        }
    }
}

enum AdminOp {
    SetListening(bool),
    SetAdvancedHeader(bool),
    SetFilterChoices(BTreeSet<MessageType>),
    AcceptAllChoices,
    SetEntityFilter(String),
    Refresh,
    AddListener(Arc<dyn FilterListener>),
    RemoveListener(Arc<dyn FilterListener>),
}

enum Command {
    Post(Arc<Message>),
    Admin(AdminOp, oneshot::Sender<()>),
    GetDisplayData(DisplayMetadata, oneshot::Sender<DisplayLookup>),
    Snapshot(oneshot::Sender<LogSnapshot>),
}

/// Cloneable handle to a running log actor.
///
/// The actor stops once every handle is dropped, after draining the commands
/// already queued, and its state is discarded with it.
#[derive(Clone)]
pub struct LogHandle {
    session_id: Option<DomainSessionId>,
    tx: mpsc::Sender<Command>,
}

impl LogHandle {
    /// Spawn `log` onto the current tokio runtime.
    pub fn spawn(log: SessionLog, queue_depth: usize) -> Self {
        let session_id = log.session_id();
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        tokio::spawn(run_log(log, rx));
        Self { session_id, tx }
    }

    pub async fn post(&self, message: Arc<Message>) -> Result<(), MonitorError> {
        self.send(Command::Post(message)).await
    }

    pub async fn set_listening(&self, listening: bool) -> Result<(), MonitorError> {
        self.admin(AdminOp::SetListening(listening)).await
    }

    pub async fn set_advanced_header(&self, advanced_header: bool) -> Result<(), MonitorError> {
        self.admin(AdminOp::SetAdvancedHeader(advanced_header)).await
    }

    pub async fn set_filter_choices(
        &self,
        choices: BTreeSet<MessageType>,
    ) -> Result<(), MonitorError> {
        self.admin(AdminOp::SetFilterChoices(choices)).await
    }

    pub async fn accept_all_choices(&self) -> Result<(), MonitorError> {
        self.admin(AdminOp::AcceptAllChoices).await
    }

    pub async fn set_entity_filter(&self, entity_marking: String) -> Result<(), MonitorError> {
        self.admin(AdminOp::SetEntityFilter(entity_marking)).await
    }

    pub async fn refresh(&self) -> Result<(), MonitorError> {
        self.admin(AdminOp::Refresh).await
    }

    pub async fn add_filter_listener(
        &self,
        listener: Arc<dyn FilterListener>,
    ) -> Result<(), MonitorError> {
        self.admin(AdminOp::AddListener(listener)).await
    }

    pub async fn remove_filter_listener(
        &self,
        listener: Arc<dyn FilterListener>,
    ) -> Result<(), MonitorError> {
        self.admin(AdminOp::RemoveListener(listener)).await
    }

    pub async fn get_display_data(
        &self,
        metadata: DisplayMetadata,
    ) -> Result<DisplayLookup, MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::GetDisplayData(metadata, tx)).await?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn snapshot(&self) -> Result<LogSnapshot, MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx)).await?;
        rx.await.map_err(|_| self.closed())
    }

    async fn admin(&self, op: AdminOp) -> Result<(), MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Admin(op, tx)).await?;
        rx.await.map_err(|_| self.closed())
    }

    async fn send(&self, command: Command) -> Result<(), MonitorError> {
        self.tx.send(command).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> MonitorError {
        MonitorError::missing_log(self.session_id)
    }
}

async fn run_log(mut log: SessionLog, mut rx: mpsc::Receiver<Command>) {
    debug!(session_id = ?log.session_id(), "log started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Post(message) => log.post_message(message),
            Command::Admin(op, ack) => {
                apply_admin(&mut log, op);
                let _ = ack.send(());
            }
            Command::GetDisplayData(metadata, reply) => {
                let _ = reply.send(log.get_display_data(&metadata));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(log.snapshot());
            }
        }
    }

    info!(
        session_id = ?log.session_id(),
        discarded = log.history.len(),
        "log closed"
    );
}

fn apply_admin(log: &mut SessionLog, op: AdminOp) {
    match op {
        AdminOp::SetListening(listening) => log.set_listening(listening),
        AdminOp::SetAdvancedHeader(advanced_header) => log.set_advanced_header(advanced_header),
        AdminOp::SetFilterChoices(choices) => log.set_filter_choices(choices),
        AdminOp::AcceptAllChoices => log.accept_all_choices(),
        AdminOp::SetEntityFilter(marking) => log.set_entity_filter(&marking),
        AdminOp::Refresh => log.refresh(),
        AdminOp::AddListener(listener) => log.add_filter_listener(listener),
        AdminOp::RemoveListener(listener) => log.remove_filter_listener(&listener),
    }
}
