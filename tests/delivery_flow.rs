use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use filegate::delivery::{
    relay_batch, ChatRelay, DecodedLink, DeletionScheduler, Delivery, DeliveryOptions, LinkOrigin,
    RelayError,
};
use filegate::storage::{FileRegistry, MemoryStorage, StoredBatch, StoredFile};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use teloxide::types::{ChatId, MessageId};

const CHANNEL: ChatId = ChatId(-1_001_234_567_890);
const USER: ChatId = ChatId(777);

/// Relay that records every call and fails the configured source ids
#[derive(Default)]
struct RecordingRelay {
    failing: HashSet<i32>,
    copied: Mutex<Vec<i32>>,
    notices: Mutex<Vec<String>>,
    deleted: Mutex<Vec<(ChatId, Vec<i32>)>>,
}

impl RecordingRelay {
    fn failing(ids: &[i32]) -> Self {
        Self {
            failing: ids.iter().copied().collect(),
            ..Self::default()
        }
    }

    fn copied(&self) -> Vec<i32> {
        self.copied.lock().expect("lock").clone()
    }

    fn deleted(&self) -> Vec<(ChatId, Vec<i32>)> {
        self.deleted.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ChatRelay for RecordingRelay {
    async fn copy_message(
        &self,
        _source: ChatId,
        _target: ChatId,
        id: MessageId,
        _protect: bool,
    ) -> Option<MessageId> {
        self.copied.lock().expect("lock").push(id.0);
        (!self.failing.contains(&id.0)).then_some(MessageId(id.0 + 10_000))
    }

    async fn send_notice(&self, _chat: ChatId, text: String, _protect: bool) -> Option<MessageId> {
        self.notices.lock().expect("lock").push(text);
        Some(MessageId(99_999))
    }

    async fn delete_messages(&self, chat: ChatId, ids: Vec<MessageId>) -> Result<(), RelayError> {
        self.deleted
            .lock()
            .expect("lock")
            .push((chat, ids.iter().map(|m| m.0).collect()));
        Ok(())
    }
}

fn service(relay: Arc<RecordingRelay>, registry: Arc<MemoryStorage>, minutes: u64) -> Delivery {
    let scheduler = Arc::new(DeletionScheduler::new(relay.clone()));
    Delivery::new(
        relay,
        registry,
        scheduler,
        DeliveryOptions {
            source_channel: CHANNEL,
            protect_content: true,
            auto_delete_minutes: minutes,
        },
    )
}

fn legacy_payload(text: &str) -> String {
    URL_SAFE_NO_PAD.encode(text)
}

#[tokio::test]
async fn failed_item_does_not_stop_the_batch() {
    let relay = RecordingRelay::failing(&[3]);
    let ids: Vec<MessageId> = (1..=5).map(MessageId).collect();

    let report = relay_batch(&relay, CHANNEL, USER, &ids, true).await;

    assert_eq!(report.success, 4);
    assert_eq!(report.failed, 1);
    assert_eq!(relay.copied(), vec![1, 2, 3, 4, 5]);
    assert_eq!(
        report.delivered,
        vec![
            MessageId(10_001),
            MessageId(10_002),
            MessageId(10_004),
            MessageId(10_005)
        ]
    );
}

#[tokio::test]
async fn legacy_range_decodes_with_channel_multiplier() {
    let registry = Arc::new(MemoryStorage::new());
    let delivery = service(Arc::new(RecordingRelay::default()), registry, 0);
    let k = CHANNEL.0.abs();

    let link = delivery
        .decode(&legacy_payload(&format!("get-{}-{}", 10 * k, 14 * k)))
        .await
        .expect("decode");
    assert!(link.is_batch);
    assert_eq!(link.origin, LinkOrigin::Legacy);
    assert_eq!(link.relay_ids, (10..=14).map(MessageId).collect::<Vec<_>>());

    let single = delivery
        .decode(&legacy_payload(&format!("get-{}", 42 * k)))
        .await
        .expect("decode");
    assert!(!single.is_batch);
    assert_eq!(single.relay_ids, vec![MessageId(42)]);

    let reversed = delivery
        .decode(&legacy_payload(&format!("get-{}-{}", 7 * k, 5 * k)))
        .await
        .expect("decode");
    assert!(reversed.relay_ids.is_empty());
}

#[tokio::test]
async fn garbage_payloads_resolve_to_empty_links() {
    let registry = Arc::new(MemoryStorage::new());
    let delivery = service(Arc::new(RecordingRelay::default()), registry, 0);

    for payload in ["", "   ", "batch_", "batch_missing", "no-such-file", "%%%"] {
        let link = delivery.decode(payload).await.expect("decode");
        assert!(link.is_empty(), "payload {payload:?} should be empty");
    }

    let k = CHANNEL.0.abs();
    let huge = delivery
        .decode(&legacy_payload(&format!("get-0-{}", 5_000 * k)))
        .await
        .expect("decode");
    assert_eq!(huge, DecodedLink::empty());
}

#[tokio::test]
async fn native_batch_counts_missing_members_as_failed() {
    let registry = Arc::new(MemoryStorage::new());
    for (uuid, message_id) in [("a", 100), ("b", 101), ("c", 102)] {
        registry
            .save_file(&StoredFile {
                uuid: uuid.to_string(),
                message_id,
                downloads: 0,
            })
            .await
            .expect("save file");
    }
    registry
        .save_batch(&StoredBatch {
            uuid: "set".to_string(),
            files: vec!["a".into(), "ghost".into(), "b".into(), "c".into()],
            downloads: 0,
        })
        .await
        .expect("save batch");

    let relay = Arc::new(RecordingRelay::failing(&[101]));
    let delivery = service(relay.clone(), registry.clone(), 0);

    let link = delivery.decode("batch_set").await.expect("decode");
    assert!(link.is_batch);
    assert_eq!(link.requested(), 4);

    let report = delivery.deliver(USER, &link).await;
    assert_eq!(report.success, 2);
    assert_eq!(report.failed, 2);
    assert_eq!(relay.copied(), vec![100, 101, 102]);

    let batch = registry.get_batch("set").await.expect("get").expect("batch");
    assert_eq!(batch.downloads, 1);
    assert_eq!(delivery.scheduler().pending().await, 0);
}

#[tokio::test(start_paused = true)]
async fn delivered_copies_are_deleted_after_the_delay() {
    let registry = Arc::new(MemoryStorage::new());
    registry
        .save_file(&StoredFile {
            uuid: "doc".to_string(),
            message_id: 5,
            downloads: 0,
        })
        .await
        .expect("save file");

    let relay = Arc::new(RecordingRelay::default());
    let delivery = service(relay.clone(), registry.clone(), 10);

    let link = delivery.decode("doc").await.expect("decode");
    let report = delivery.deliver(USER, &link).await;
    assert_eq!(report.success, 1);
    assert_eq!(relay.notices.lock().expect("lock").len(), 1);
    assert_eq!(delivery.scheduler().pending().await, 1);

    tokio::time::sleep(Duration::from_secs(9 * 60)).await;
    assert!(relay.deleted().is_empty());

    tokio::time::sleep(Duration::from_secs(61)).await;
    tokio::task::yield_now().await;
    assert_eq!(relay.deleted(), vec![(USER, vec![10_005, 99_999])]);
    assert_eq!(delivery.scheduler().pending().await, 0);

    let file = registry.get_file("doc").await.expect("get").expect("file");
    assert_eq!(file.downloads, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drops_pending_deletions() {
    let relay = Arc::new(RecordingRelay::default());
    let scheduler = DeletionScheduler::new(relay.clone());

    scheduler
        .schedule(USER, vec![MessageId(1)], Duration::from_secs(60))
        .await;
    scheduler
        .schedule(USER, vec![MessageId(2)], Duration::from_secs(120))
        .await;
    assert_eq!(scheduler.pending().await, 2);

    scheduler.shutdown().await;
    tokio::time::sleep(Duration::from_secs(300)).await;
    tokio::task::yield_now().await;

    assert!(relay.deleted().is_empty());
    assert_eq!(scheduler.pending().await, 0);
}

#[tokio::test(start_paused = true)]
async fn large_legacy_range_is_deleted_in_batches() {
    let relay = Arc::new(RecordingRelay::default());
    let delivery = service(relay.clone(), Arc::new(MemoryStorage::new()), 1);
    let k = CHANNEL.0.abs();

    let link = delivery
        .decode(&legacy_payload(&format!("get-{}-{}", k, 200 * k)))
        .await
        .expect("decode");
    let report = delivery.deliver(USER, &link).await;
    assert_eq!(report.success, 200);

    tokio::time::sleep(Duration::from_secs(61)).await;
    tokio::task::yield_now().await;

    let deleted = relay.deleted();
    let sizes: Vec<usize> = deleted.iter().map(|(_, ids)| ids.len()).collect();
    assert_eq!(sizes, vec![100, 100, 1]);
    assert!(deleted.iter().all(|(chat, _)| *chat == USER));
    assert_eq!(deleted[2].1, vec![99_999]);
    assert_eq!(delivery.scheduler().pending().await, 0);
}
