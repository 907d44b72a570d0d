//! Deferred deletion of delivered messages
//!
//! Each delivery event arms one detached task. Tasks are registered by id
//! with a cancellation token and remove themselves when done. Nothing is
//! persisted: pending deletions are lost on restart.

use super::ChatRelay;
use crate::config::TELEGRAM_DELETE_BATCH_LIMIT;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use teloxide::types::{ChatId, MessageId};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to one pending deletion
#[derive(Debug, Clone)]
pub struct DeletionHandle {
    id: u64,
    token: Arc<CancellationToken>,
}

impl DeletionHandle {
    /// Registry id
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Cancels the deletion if it has not fired yet
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Registry of pending deletion timers
pub struct DeletionScheduler {
    relay: Arc<dyn ChatRelay>,
    tasks: Arc<RwLock<HashMap<u64, Arc<CancellationToken>>>>,
    next_id: AtomicU64,
}

impl DeletionScheduler {
    /// Creates an empty scheduler deleting through `relay`
    #[must_use]
    pub fn new(relay: Arc<dyn ChatRelay>) -> Self {
        Self {
            relay,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Deletes `ids` from `chat` after `delay`, best effort.
    ///
    /// Returns immediately; failures are logged, never surfaced.
    pub async fn schedule(
        &self,
        chat: ChatId,
        ids: Vec<MessageId>,
        delay: Duration,
    ) -> DeletionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = Arc::new(CancellationToken::new());
        self.tasks.write().await.insert(id, token.clone());

        let relay = self.relay.clone();
        let tasks = self.tasks.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = task_token.cancelled() => {
                    debug!("Deletion {} in chat {} cancelled", id, chat);
                }
                () = tokio::time::sleep(delay) => {
                    delete_in_chunks(relay.as_ref(), chat, &ids).await;
                }
            }
            tasks.write().await.remove(&id);
        });

        debug!("Scheduled deletion {} in chat {} after {:?}", id, chat, delay);
        DeletionHandle { id, token }
    }

    /// Cancels a pending deletion by id
    ///
    /// Returns `true` if it was still pending.
    pub async fn cancel(&self, id: u64) -> bool {
        let tasks = self.tasks.read().await;
        if let Some(token) = tasks.get(&id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Number of deletions that have not fired yet
    pub async fn pending(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Cancels every pending deletion
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.write().await;
        let count = tasks.len();
        for (_, token) in tasks.drain() {
            token.cancel();
        }
        if count > 0 {
            info!("Dropped {} pending deletions on shutdown", count);
        }
    }
}

/// Deletes `ids` in calls of at most [`TELEGRAM_DELETE_BATCH_LIMIT`] ids.
/// A failed chunk is logged and the rest still go out.
async fn delete_in_chunks(relay: &dyn ChatRelay, chat: ChatId, ids: &[MessageId]) {
    let mut deleted = 0;
    for chunk in ids.chunks(TELEGRAM_DELETE_BATCH_LIMIT) {
        match relay.delete_messages(chat, chunk.to_vec()).await {
            Ok(()) => deleted += chunk.len(),
            Err(e) => warn!(
                "Auto-delete of {} messages in chat {} failed: {}",
                chunk.len(),
                chat,
                e
            ),
        }
    }
    debug!("Auto-deleted {}/{} messages in chat {}", deleted, ids.len(), chat);
}
