use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use msgmon_protocol::{DisplayLookup, DisplayMetadata, DomainSessionId, Message, MessageType};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::filter::FilterListener;
use crate::log::{LogHandle, LogSnapshot, SessionLog};
use crate::publisher::{ObservedPublisher, UpdatePublisher};

/// Builder that refuses to produce a router without a publisher.
#[derive(Default)]
pub struct RouterBuilder {
    config: MonitorConfig,
    publisher: Option<Arc<dyn UpdatePublisher>>,
}

impl RouterBuilder {
    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn UpdatePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Validate and start the router. Spawns the system log, so this must
    /// run inside a tokio runtime.
    pub fn build(self) -> Result<Router, MonitorError> {
        let publisher = self.publisher.ok_or(MonitorError::MissingPublisher)?;
        self.config.validate()?;

        let system = LogHandle::spawn(
            SessionLog::system(self.config.capacity, publisher.clone()),
            self.config.command_queue,
        );
        info!(
            capacity = self.config.capacity,
            command_queue = self.config.command_queue,
            "message router started"
        );

        Ok(Router {
            config: self.config,
            publisher,
            system,
            sessions: DashMap::new(),
            observed: DashMap::new(),
        })
    }
}

/// Routes incoming messages to per-session logs and fronts every
/// administrative operation on those logs.
///
/// Uses `DashMap` for the session map so lifecycle changes, message delivery
/// and control-plane calls can run concurrently without a global lock.
pub struct Router {
    config: MonitorConfig,
    publisher: Arc<dyn UpdatePublisher>,
    system: LogHandle,
    sessions: DashMap<DomainSessionId, LogHandle>,
    /// Who is watching each session. Kept apart from `sessions` because a
    /// client may start watching before the session goes active.
    ///
    /// Lock order: a `sessions` guard may be held while touching `observed`,
    /// never the other way round.
    observed: DashMap<DomainSessionId, Observation>,
}

/// Watch count for one session and the flag its log's publisher reads.
/// The flag is set exactly while `watchers > 0`.
#[derive(Default)]
struct Observation {
    flag: Arc<AtomicBool>,
    watchers: usize,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Deliver one message from the transport. Messages for sessions without
    /// a log are dropped.
    pub async fn message_arrived(&self, message: Message) {
        let message = Arc::new(message);
        match message.domain_session_id {
            Some(session_id) => {
                // Clone the handle so no map guard is held across the await.
                let Some(log) = self.session_log(session_id) else {
                    debug!(
                        session_id,
                        message_type = %message.message_type,
                        "no log for session, dropping message"
                    );
                    return;
                };
                if log.post(message).await.is_err() {
                    debug!(session_id, "session log closed during delivery, dropping message");
                }
            }
            None => {
                if let Err(e) = self.system.post(message).await {
                    warn!(error = %e, "failed to deliver system message");
                }
            }
        }
    }

    /// Create the log for a session that just became active. Returns false
    /// if one already existed.
    pub fn session_active(&self, session_id: DomainSessionId) -> bool {
        match self.sessions.entry(session_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let publisher = Arc::new(ObservedPublisher::new(
                    self.publisher.clone(),
                    self.observation_flag(session_id),
                ));
                let log = SessionLog::domain_session(session_id, self.config.capacity, publisher);
                let _ = slot.insert(LogHandle::spawn(log, self.config.command_queue));
                info!(session_id, "session log created");
                true
            }
        }
    }

    /// Discard a session's log. Returns false if there was none.
    pub fn session_inactive(&self, session_id: DomainSessionId) -> bool {
        // Hold the session slot until the watch entry is settled so a racing
        // `session_active` cannot pick up a flag that is about to be dropped.
        let Entry::Occupied(slot) = self.sessions.entry(session_id) else {
            return false;
        };
        let _ = self
            .observed
            .remove_if(&session_id, |_, observation| observation.watchers == 0);
        let _ = slot.remove();
        info!(session_id, "session log discarded");
        true
    }

    /// Add a watcher to a session and start delivering its events. Returns
    /// the new watcher count.
    pub fn monitor_session(&self, session_id: DomainSessionId) -> usize {
        let mut observation = self.observed.entry(session_id).or_default();
        observation.watchers += 1;
        observation.flag.store(true, Ordering::Release);
        debug!(session_id, watchers = observation.watchers, "monitoring session");
        observation.watchers
    }

    /// Drop one watcher. Delivery stops once nobody is left watching;
    /// history is still captured. Returns the remaining watcher count.
    pub fn ignore_session(&self, session_id: DomainSessionId) -> usize {
        let log_slot = self.sessions.entry(session_id);
        let has_log = matches!(log_slot, Entry::Occupied(_));

        let remaining = match self.observed.entry(session_id) {
            Entry::Vacant(_) => 0,
            Entry::Occupied(mut slot) => {
                let observation = slot.get_mut();
                observation.watchers = observation.watchers.saturating_sub(1);
                let remaining = observation.watchers;
                if remaining == 0 {
                    observation.flag.store(false, Ordering::Release);
                    if !has_log {
                        let _ = slot.remove();
                    }
                }
                remaining
            }
        };
        drop(log_slot);

        debug!(session_id, watchers = remaining, "ignoring session");
        remaining
    }

    pub fn is_monitored(&self, session_id: DomainSessionId) -> bool {
        self.watchers(session_id) > 0
    }

    /// Number of clients currently watching a session.
    pub fn watchers(&self, session_id: DomainSessionId) -> usize {
        self.observed
            .get(&session_id)
            .map_or(0, |observation| observation.watchers)
    }

    /// Ids of every session with a live log, ascending.
    pub fn active_sessions(&self) -> Vec<DomainSessionId> {
        let mut ids: Vec<_> = self.sessions.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Handle to the log for `session_id`, or to the system log for `None`.
    pub fn log(&self, session_id: Option<DomainSessionId>) -> Result<LogHandle, MonitorError> {
        match session_id {
            None => Ok(self.system.clone()),
            Some(id) => self
                .session_log(id)
                .ok_or(MonitorError::UnknownSession(id)),
        }
    }

    pub async fn set_listening(
        &self,
        session_id: Option<DomainSessionId>,
        listening: bool,
    ) -> Result<(), MonitorError> {
        self.log(session_id)?.set_listening(listening).await
    }

    pub async fn set_advanced_header(
        &self,
        session_id: Option<DomainSessionId>,
        advanced_header: bool,
    ) -> Result<(), MonitorError> {
        self.log(session_id)?
            .set_advanced_header(advanced_header)
            .await
    }

    pub async fn set_filter_choices(
        &self,
        session_id: Option<DomainSessionId>,
        choices: BTreeSet<MessageType>,
    ) -> Result<(), MonitorError> {
        self.log(session_id)?.set_filter_choices(choices).await
    }

    pub async fn accept_all_choices(
        &self,
        session_id: Option<DomainSessionId>,
    ) -> Result<(), MonitorError> {
        self.log(session_id)?.accept_all_choices().await
    }

    /// Restrict a session's entity state messages to one entity marking; an
    /// empty marking clears the restriction.
    pub async fn set_entity_filter(
        &self,
        session_id: DomainSessionId,
        entity_marking: impl Into<String>,
    ) -> Result<(), MonitorError> {
        self.log(Some(session_id))?
            .set_entity_filter(entity_marking.into())
            .await
    }

    pub async fn refresh(&self, session_id: Option<DomainSessionId>) -> Result<(), MonitorError> {
        self.log(session_id)?.refresh().await
    }

    pub async fn get_display_data(
        &self,
        session_id: Option<DomainSessionId>,
        metadata: DisplayMetadata,
    ) -> Result<DisplayLookup, MonitorError> {
        self.log(session_id)?.get_display_data(metadata).await
    }

    pub async fn snapshot(
        &self,
        session_id: Option<DomainSessionId>,
    ) -> Result<LogSnapshot, MonitorError> {
        self.log(session_id)?.snapshot().await
    }

    pub async fn add_filter_listener(
        &self,
        session_id: Option<DomainSessionId>,
        listener: Arc<dyn FilterListener>,
    ) -> Result<(), MonitorError> {
        self.log(session_id)?.add_filter_listener(listener).await
    }

    pub async fn remove_filter_listener(
        &self,
        session_id: Option<DomainSessionId>,
        listener: Arc<dyn FilterListener>,
    ) -> Result<(), MonitorError> {
        self.log(session_id)?.remove_filter_listener(listener).await
    }

    fn session_log(&self, session_id: DomainSessionId) -> Option<LogHandle> {
        self.sessions.get(&session_id).map(|r| r.value().clone())
    }

    fn observation_flag(&self, session_id: DomainSessionId) -> Arc<AtomicBool> {
        self.observed.entry(session_id).or_default().flag.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{RecordingPublisher, message};

    fn router(capacity: usize) -> (Router, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let router = Router::builder()
            .config(MonitorConfig::with_capacity(capacity))
            .publisher(publisher.clone())
            .build()
            .unwrap();
        (router, publisher)
    }

    #[tokio::test]
    async fn build_without_publisher_fails_fast() {
        let result = Router::builder().build();
        assert!(matches!(result, Err(MonitorError::MissingPublisher)));
    }

    #[tokio::test]
    async fn build_rejects_zero_capacity() {
        let result = Router::builder()
            .config(MonitorConfig::with_capacity(0))
            .publisher(Arc::new(RecordingPublisher::default()))
            .build();
        assert!(matches!(result, Err(MonitorError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn system_messages_reach_global_log() {
        let (router, publisher) = router(5);
        let msg = message(MessageType::ModuleStatus, None, 1);
        router.message_arrived(msg.clone()).await;

        let snap = router.snapshot(None).await.unwrap();
        assert_eq!(snap.display, vec![msg.metadata()]);
        assert_eq!(publisher.kinds(), vec!["choices_changed", "received"]);
    }

    #[tokio::test]
    async fn session_active_is_idempotent() {
        let (router, _publisher) = router(5);
        assert!(router.session_active(4));
        assert!(!router.session_active(4));
        assert_eq!(router.active_sessions(), vec![4]);

        assert!(router.session_inactive(4));
        assert!(!router.session_inactive(4));
        assert!(router.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn unmonitored_session_captures_without_publishing() {
        let (router, publisher) = router(5);
        let _ = router.session_active(2);
        let msg = message(MessageType::LearnerState, Some(2), 1);
        router.message_arrived(msg.clone()).await;

        let snap = router.snapshot(Some(2)).await.unwrap();
        assert_eq!(snap.display, vec![msg.metadata()]);
        assert!(publisher.events().is_empty());

        router.monitor_session(2);
        assert!(router.is_monitored(2));
        router.refresh(Some(2)).await.unwrap();
        assert_eq!(publisher.events().len(), 4);
        assert!(publisher.events().iter().all(|e| e.session_id() == Some(2)));

        router.ignore_session(2);
        assert!(!router.is_monitored(2));
        let _ = publisher.take();
        router
            .message_arrived(message(MessageType::LearnerState, Some(2), 2))
            .await;
        let _ = router.snapshot(Some(2)).await.unwrap();
        assert!(publisher.events().is_empty());
    }

    #[tokio::test]
    async fn monitoring_before_activation_is_honoured() {
        let (router, publisher) = router(5);
        router.monitor_session(8);
        let _ = router.session_active(8);
        router
            .message_arrived(message(MessageType::Siman, Some(8), 1))
            .await;
        let _ = router.snapshot(Some(8)).await.unwrap();
        assert_eq!(publisher.kinds(), vec!["choices_changed", "received"]);
    }

    #[tokio::test]
    async fn session_stays_monitored_until_last_watcher_leaves() {
        let (router, publisher) = router(5);
        let _ = router.session_active(3);
        assert_eq!(router.monitor_session(3), 1);
        assert_eq!(router.monitor_session(3), 2);

        assert_eq!(router.ignore_session(3), 1);
        assert!(router.is_monitored(3));
        router
            .message_arrived(message(MessageType::LearnerState, Some(3), 1))
            .await;
        let _ = router.snapshot(Some(3)).await.unwrap();
        assert_eq!(publisher.kinds(), vec!["choices_changed", "received"]);

        assert_eq!(router.ignore_session(3), 0);
        assert!(!router.is_monitored(3));
        // The log still holds the entry for its publisher.
        assert!(router.observed.contains_key(&3));
    }

    #[tokio::test]
    async fn watch_entries_for_sessions_without_log_are_released() {
        let (router, _publisher) = router(5);
        let _ = router.monitor_session(21);
        assert_eq!(router.ignore_session(21), 0);
        assert_eq!(router.ignore_session(22), 0);
        assert!(router.observed.is_empty());
    }

    #[tokio::test]
    async fn reactivated_session_publishes_once_watched() {
        let (router, publisher) = router(5);
        let _ = router.session_active(6);
        assert!(router.session_inactive(6));
        assert!(router.observed.is_empty());

        let _ = router.session_active(6);
        let _ = router.monitor_session(6);
        router
            .message_arrived(message(MessageType::LearnerState, Some(6), 1))
            .await;
        let _ = router.snapshot(Some(6)).await.unwrap();
        assert_eq!(publisher.kinds(), vec!["choices_changed", "received"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lifecycle_races_never_orphan_the_publisher_flag() {
        let (router, _publisher) = router(5);
        let router = Arc::new(router);
        let mut tasks = Vec::new();
        for worker in 0..4 {
            let router = router.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..200 {
                    if worker % 2 == 0 {
                        let _ = router.session_active(1);
                    } else {
                        let _ = router.session_inactive(1);
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let _ = router.session_active(1);
        let _ = router.monitor_session(1);
        let flag = router.observed.get(&1).map(|o| o.flag.clone()).unwrap();
        assert!(flag.load(Ordering::Acquire));
        // Only the live log and the watch entry share the flag.
        assert_eq!(Arc::strong_count(&flag), 3);
    }

    #[tokio::test]
    async fn message_for_unknown_session_is_dropped() {
        let (router, publisher) = router(5);
        router
            .message_arrived(message(MessageType::LearnerState, Some(99), 1))
            .await;
        assert!(publisher.events().is_empty());
        assert!(router.snapshot(None).await.unwrap().history.is_empty());
    }

    #[tokio::test]
    async fn admin_calls_on_unknown_session_report_it() {
        let (router, _publisher) = router(5);
        let meta = message(MessageType::Ack, Some(5), 1).metadata();

        assert!(matches!(
            router.set_listening(Some(5), false).await,
            Err(MonitorError::UnknownSession(5))
        ));
        assert!(matches!(
            router.set_entity_filter(5, "Alpha1").await,
            Err(MonitorError::UnknownSession(5))
        ));
        assert!(matches!(
            router.get_display_data(Some(5), meta).await,
            Err(MonitorError::UnknownSession(5))
        ));
        // The global log is unaffected.
        assert!(router.set_listening(None, true).await.is_ok());
    }

    #[tokio::test]
    async fn logs_are_isolated_per_session() {
        let (router, _publisher) = router(5);
        let _ = router.session_active(1);
        let _ = router.session_active(2);
        router
            .message_arrived(message(MessageType::LearnerState, Some(1), 1))
            .await;
        router
            .set_filter_choices(Some(2), BTreeSet::new())
            .await
            .unwrap();

        let one = router.snapshot(Some(1)).await.unwrap();
        let two = router.snapshot(Some(2)).await.unwrap();
        assert_eq!(one.display.len(), 1);
        assert!(two.history.is_empty());
        assert!(one.selected_choices.contains(&MessageType::LearnerState));
    }
}
