//! File and batch delivery
//!
//! Copies content from the private relay channel into the requesting chat,
//! keeps download counters and arms auto-deletion of what was delivered.

use crate::storage::{FileRegistry, StorageError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use teloxide::types::{ChatId, MessageId};
use thiserror::Error;
use tracing::{info, warn};

/// Start payload grammar and legacy decoding
pub mod deep_link;
/// Deferred deletion registry
pub mod scheduler;

pub use deep_link::{decode_deep_link, DecodedLink, LinkOrigin, StartPayload};
pub use scheduler::{DeletionHandle, DeletionScheduler};

/// Telegram-side failure of a relay operation
#[derive(Error, Debug)]
pub enum RelayError {
    /// Bot API call failed
    #[error("telegram request failed: {0}")]
    Telegram(String),
}

/// Message transport used by delivery
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatRelay: Send + Sync {
    /// Copies one message from `source` into `target`; `None` on failure
    async fn copy_message(
        &self,
        source: ChatId,
        target: ChatId,
        id: MessageId,
        protect: bool,
    ) -> Option<MessageId>;

    /// Sends an HTML notice; `None` on failure
    async fn send_notice(&self, chat: ChatId, text: String, protect: bool) -> Option<MessageId>;

    /// Deletes messages from `chat`; Telegram accepts at most
    /// [`TELEGRAM_DELETE_BATCH_LIMIT`](crate::config::TELEGRAM_DELETE_BATCH_LIMIT)
    /// ids per call
    async fn delete_messages(&self, chat: ChatId, ids: Vec<MessageId>)
        -> Result<(), RelayError>;
}

/// Aggregate result of a relay run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Items delivered
    pub success: usize,
    /// Items that could not be delivered
    pub failed: usize,
    /// Ids of the delivered copies in the target chat
    pub delivered: Vec<MessageId>,
}

/// Relays `ids` in order. A failed item is counted and skipped.
pub async fn relay_batch(
    relay: &dyn ChatRelay,
    source: ChatId,
    target: ChatId,
    ids: &[MessageId],
    protect: bool,
) -> BatchReport {
    let mut report = BatchReport::default();
    for &id in ids {
        match relay.copy_message(source, target, id, protect).await {
            Some(copied) => {
                report.success += 1;
                report.delivered.push(copied);
            }
            None => {
                warn!("Failed to relay message {} to chat {}", id.0, target);
                report.failed += 1;
            }
        }
    }
    report
}

/// Text of the notice sent alongside auto-deleted files
#[must_use]
pub fn auto_delete_notice(minutes: u64) -> String {
    format!(
        "⏳ <b>Auto Delete Information</b>\n\n\
         ➜ This file will be deleted in {minutes} minutes.\n\
         ➜ Forward this file to your saved messages or another chat to save it permanently."
    )
}

/// Delivery settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOptions {
    /// Private channel files are copied from
    pub source_channel: ChatId,
    /// Protect copies from forwarding and saving
    pub protect_content: bool,
    /// Auto-delete delay in minutes; 0 disables
    pub auto_delete_minutes: u64,
}

/// Delivery service shared by the bot handlers
pub struct Delivery {
    relay: Arc<dyn ChatRelay>,
    registry: Arc<dyn FileRegistry>,
    scheduler: Arc<DeletionScheduler>,
    options: DeliveryOptions,
}

impl Delivery {
    /// Wires the service together
    #[must_use]
    pub fn new(
        relay: Arc<dyn ChatRelay>,
        registry: Arc<dyn FileRegistry>,
        scheduler: Arc<DeletionScheduler>,
        options: DeliveryOptions,
    ) -> Self {
        Self {
            relay,
            registry,
            scheduler,
            options,
        }
    }

    /// Configured options
    #[must_use]
    pub const fn options(&self) -> &DeliveryOptions {
        &self.options
    }

    /// Deletion registry
    #[must_use]
    pub fn scheduler(&self) -> &Arc<DeletionScheduler> {
        &self.scheduler
    }

    /// Resolves a start payload against the registry
    ///
    /// # Errors
    ///
    /// Returns an error if the registry fails.
    pub async fn decode(&self, payload: &str) -> Result<DecodedLink, StorageError> {
        decode_deep_link(payload, self.registry.as_ref(), self.options.source_channel.0).await
    }

    /// Relays a decoded link into `target`.
    ///
    /// Updates download counters, then sends one auto-delete notice and
    /// schedules it together with the delivered copies. Never fails: counter
    /// and notice errors are logged.
    pub async fn deliver(&self, target: ChatId, link: &DecodedLink) -> BatchReport {
        let mut report = relay_batch(
            self.relay.as_ref(),
            self.options.source_channel,
            target,
            &link.relay_ids,
            self.options.protect_content,
        )
        .await;
        report.failed += link.unresolved;

        if report.success > 0 {
            self.count_download(&link.origin).await;
        }
        self.arm_auto_delete(target, &report).await;

        info!(
            "Delivered {}/{} items to chat {}",
            report.success,
            report.success + report.failed,
            target
        );
        report
    }

    async fn count_download(&self, origin: &LinkOrigin) {
        let result = match origin {
            LinkOrigin::File(uuid) => self.registry.increment_downloads(uuid).await,
            LinkOrigin::Batch(uuid) => self.registry.increment_batch_downloads(uuid).await,
            LinkOrigin::Legacy | LinkOrigin::Unknown => return,
        };
        if let Err(e) = result {
            warn!("Failed to update download counter: {}", e);
        }
    }

    async fn arm_auto_delete(&self, target: ChatId, report: &BatchReport) {
        let minutes = self.options.auto_delete_minutes;
        if minutes == 0 || report.delivered.is_empty() {
            return;
        }

        let mut ids = report.delivered.clone();
        if let Some(notice) = self
            .relay
            .send_notice(
                target,
                auto_delete_notice(minutes),
                self.options.protect_content,
            )
            .await
        {
            ids.push(notice);
        }

        self.scheduler
            .schedule(target, ids, Duration::from_secs(minutes.saturating_mul(60)))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, StoredBatch, StoredFile};
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SOURCE: ChatId = ChatId(-100_555);
    const TARGET: ChatId = ChatId(42);

    fn options(auto_delete_minutes: u64) -> DeliveryOptions {
        DeliveryOptions {
            source_channel: SOURCE,
            protect_content: true,
            auto_delete_minutes,
        }
    }

    #[tokio::test]
    async fn test_relay_batch_continues_after_failure() {
        let mut relay = MockChatRelay::new();
        relay
            .expect_copy_message()
            .times(5)
            .returning(|_, _, id, _| (id.0 != 3).then(|| MessageId(id.0 + 1000)));

        let ids: Vec<MessageId> = (1..=5).map(MessageId).collect();
        let report = relay_batch(&relay, SOURCE, TARGET, &ids, false).await;

        assert_eq!(report.success, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(
            report.delivered,
            vec![
                MessageId(1001),
                MessageId(1002),
                MessageId(1004),
                MessageId(1005)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_file_delivery_counts_and_schedules() {
        let registry = Arc::new(MemoryStorage::new());
        registry
            .save_file(&StoredFile {
                uuid: "f1".into(),
                message_id: 7,
                downloads: 0,
            })
            .await
            .expect("save");

        let deleted = Arc::new(AtomicUsize::new(0));
        let deleted_in_mock = deleted.clone();
        let mut relay = MockChatRelay::new();
        relay
            .expect_copy_message()
            .with(eq(SOURCE), eq(TARGET), eq(MessageId(7)), eq(true))
            .times(1)
            .returning(|_, _, _, _| Some(MessageId(500)));
        relay
            .expect_send_notice()
            .withf(|_, text, protect| text.contains("5 minutes") && *protect)
            .times(1)
            .returning(|_, _, _| Some(MessageId(501)));
        relay
            .expect_delete_messages()
            .withf(|chat, ids| *chat == TARGET && ids == &[MessageId(500), MessageId(501)])
            .times(1)
            .returning(move |_, _| {
                deleted_in_mock.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        let relay: Arc<dyn ChatRelay> = Arc::new(relay);

        let delivery = Delivery::new(
            relay.clone(),
            registry.clone(),
            Arc::new(DeletionScheduler::new(relay)),
            options(5),
        );
        let link = delivery.decode("f1").await.expect("decode");
        let report = delivery.deliver(TARGET, &link).await;

        assert_eq!(report.success, 1);
        let file = registry.get_file("f1").await.expect("get").expect("file");
        assert_eq!(file.downloads, 1);
        assert_eq!(delivery.scheduler().pending().await, 1);

        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_with_missing_member_counts_failure() {
        let registry = Arc::new(MemoryStorage::new());
        registry
            .save_file(&StoredFile {
                uuid: "a".into(),
                message_id: 1,
                downloads: 0,
            })
            .await
            .expect("save");
        registry
            .save_batch(&StoredBatch {
                uuid: "b".into(),
                files: vec!["a".into(), "missing".into()],
                downloads: 0,
            })
            .await
            .expect("save");

        let mut relay = MockChatRelay::new();
        relay
            .expect_copy_message()
            .times(1)
            .returning(|_, _, _, _| Some(MessageId(9)));
        relay.expect_send_notice().never();
        let relay: Arc<dyn ChatRelay> = Arc::new(relay);

        let delivery = Delivery::new(
            relay.clone(),
            registry.clone(),
            Arc::new(DeletionScheduler::new(relay)),
            options(0),
        );
        let link = delivery.decode("batch_b").await.expect("decode");
        let report = delivery.deliver(TARGET, &link).await;

        assert_eq!((report.success, report.failed), (1, 1));
        let batch = registry.get_batch("b").await.expect("get").expect("batch");
        assert_eq!(batch.downloads, 1);
        assert_eq!(delivery.scheduler().pending().await, 0);
    }

    #[tokio::test]
    async fn test_failed_single_file_keeps_counter() {
        let registry = Arc::new(MemoryStorage::new());
        registry
            .save_file(&StoredFile {
                uuid: "f".into(),
                message_id: 3,
                downloads: 4,
            })
            .await
            .expect("save");

        let mut relay = MockChatRelay::new();
        relay.expect_copy_message().returning(|_, _, _, _| None);
        let relay: Arc<dyn ChatRelay> = Arc::new(relay);

        let delivery = Delivery::new(
            relay.clone(),
            registry.clone(),
            Arc::new(DeletionScheduler::new(relay)),
            options(10),
        );
        let link = delivery.decode("f").await.expect("decode");
        let report = delivery.deliver(TARGET, &link).await;

        assert_eq!((report.success, report.failed), (0, 1));
        let file = registry.get_file("f").await.expect("get").expect("file");
        assert_eq!(file.downloads, 4);
    }
}
