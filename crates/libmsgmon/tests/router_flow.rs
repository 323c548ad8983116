//! End-to-end flows through the router: lifecycle, observation gating and
//! concurrent delivery racing filter changes.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use libmsgmon::{MonitorConfig, MonitorError, Router, UpdatePublisher};
use msgmon_protocol::{DisplayLookup, Message, MessageType, UpdateEvent};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<UpdateEvent>>,
}

impl Recorder {
    fn events(&self) -> Vec<UpdateEvent> {
        self.events.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl UpdatePublisher for Recorder {
    fn publish(&self, event: UpdateEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn message(message_type: MessageType, session: Option<i32>, seq: i64) -> Message {
    Message {
        message_type,
        timestamp: 1_700_000_000_000 + seq,
        sequence_number: seq,
        sender_address: "Domain_Queue".to_string(),
        destination_address: "Monitor_Topic".to_string(),
        domain_session_id: session,
        needs_ack: false,
        payload: serde_json::json!({"seq": seq}),
    }
}

fn router(capacity: usize) -> (Arc<Router>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let router = Router::builder()
        .config(MonitorConfig::with_capacity(capacity))
        .publisher(recorder.clone())
        .build()
        .unwrap();
    (Arc::new(router), recorder)
}

#[tokio::test]
async fn builder_requires_publisher() {
    assert!(matches!(
        Router::builder().build(),
        Err(MonitorError::MissingPublisher)
    ));
}

#[tokio::test]
async fn inactive_session_drops_traffic_and_rejects_admin() {
    let (router, recorder) = router(10);
    router.monitor_session(3);
    assert!(router.session_active(3));

    let kept = message(MessageType::LearnerState, Some(3), 1);
    router.message_arrived(kept.clone()).await;
    assert_eq!(router.snapshot(Some(3)).await.unwrap().history.len(), 1);

    assert!(router.session_inactive(3));
    recorder.clear();

    router
        .message_arrived(message(MessageType::LearnerState, Some(3), 2))
        .await;
    assert!(recorder.events().is_empty());
    assert!(matches!(
        router.get_display_data(Some(3), kept.metadata()).await,
        Err(MonitorError::UnknownSession(3))
    ));
    assert!(matches!(
        router.refresh(Some(3)).await,
        Err(MonitorError::UnknownSession(3))
    ));

    // Still observed, so a reactivated session publishes straight away.
    assert!(router.is_monitored(3));
    assert!(router.session_active(3));
    router
        .message_arrived(message(MessageType::LearnerState, Some(3), 3))
        .await;
    let snap = router.snapshot(Some(3)).await.unwrap();
    assert_eq!(snap.history.len(), 1);
    assert!(
        recorder
            .events()
            .iter()
            .any(|e| matches!(e, UpdateEvent::Received { session_id: Some(3), .. }))
    );
}

#[tokio::test]
async fn unobserved_session_flag_is_dropped_on_inactive() {
    let (router, _recorder) = router(10);
    let _ = router.session_active(4);
    router.ignore_session(4);
    let _ = router.session_inactive(4);
    assert!(!router.is_monitored(4));
    assert!(router.active_sessions().is_empty());
}

#[tokio::test]
async fn global_and_session_traffic_are_routed_apart() {
    let (router, recorder) = router(10);
    router.monitor_session(1);
    let _ = router.session_active(1);

    let status = message(MessageType::ModuleStatus, None, 1);
    let learner = message(MessageType::LearnerState, Some(1), 2);
    router.message_arrived(status.clone()).await;
    router.message_arrived(learner.clone()).await;

    let global = router.snapshot(None).await.unwrap();
    let session = router.snapshot(Some(1)).await.unwrap();
    assert_eq!(global.display, vec![status.metadata()]);
    assert_eq!(session.display, vec![learner.metadata()]);

    let received: Vec<_> = recorder
        .events()
        .into_iter()
        .filter(|e| matches!(e, UpdateEvent::Received { .. }))
        .map(|e| e.session_id())
        .collect();
    assert_eq!(received, vec![None, Some(1)]);

    assert!(
        router
            .get_display_data(None, learner.metadata())
            .await
            .map(|lookup| lookup == DisplayLookup::NotFound)
            .unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_posts_and_filter_changes_converge() {
    let (router, _recorder) = router(1_000);
    let _ = router.session_active(9);

    let kinds = [
        MessageType::LearnerState,
        MessageType::EntityState,
        MessageType::Ack,
    ];
    // Make every type known up front so discovery cannot widen the selection
    // behind the admin task's back.
    for (seq, kind) in kinds.iter().enumerate() {
        router
            .message_arrived(message(*kind, Some(9), seq as i64))
            .await;
    }

    let mut tasks = Vec::new();
    for worker in 0..4i64 {
        let router = router.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..50i64 {
                let seq = 100 + worker * 1_000 + n;
                let kind = kinds[(n as usize) % kinds.len()];
                router.message_arrived(message(kind, Some(9), seq)).await;
            }
        }));
    }

    let admin = {
        let router = router.clone();
        tokio::spawn(async move {
            for round in 0..20 {
                let choice: BTreeSet<_> = [kinds[round % kinds.len()]].into();
                router.set_filter_choices(Some(9), choice).await.unwrap();
                tokio::task::yield_now().await;
            }
            router
                .set_filter_choices(
                    Some(9),
                    [MessageType::LearnerState, MessageType::Ack].into(),
                )
                .await
                .unwrap();
        })
    };

    for task in tasks {
        task.await.unwrap();
    }
    admin.await.unwrap();

    let snap = router.snapshot(Some(9)).await.unwrap();
    assert_eq!(snap.history.len(), 3 + 4 * 50);
    let expected: Vec<_> = snap
        .history
        .iter()
        .filter(|m| snap.selected_choices.contains(&m.message_type))
        .map(|m| m.metadata())
        .collect();
    assert_eq!(
        snap.selected_choices,
        [MessageType::LearnerState, MessageType::Ack].into()
    );
    assert_eq!(snap.display, expected);
}
