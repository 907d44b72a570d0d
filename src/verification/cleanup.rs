use super::TokenVerifier;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Runs [`TokenVerifier::cleanup_expired`] every `every` until `shutdown` fires.
///
/// The first pass runs immediately. Failures are logged and retried on the
/// next tick.
pub fn spawn_cleanup_task(
    verifier: Arc<TokenVerifier>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Verification cleanup task stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = verifier.cleanup_expired().await {
                        error!("Verification cleanup failed: {}", e);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::TokenPolicy;
    use crate::shortener::{MockShortener, ShortenerError};
    use crate::storage::{MemoryStorage, VerificationRecord, VerificationStore};
    use chrono::{Duration as ChronoDuration, Utc};

    #[tokio::test(start_paused = true)]
    async fn test_periodic_cleanup_until_shutdown() {
        let store = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut shortener = MockShortener::new();
        shortener
            .expect_shorten()
            .returning(|_| Err(ShortenerError::NotConfigured));
        let verifier = Arc::new(
            TokenVerifier::new(
                store.clone(),
                Arc::new(shortener),
                Arc::new(TokenPolicy::default()),
                "bot",
            )
            .with_clock(clock.clone()),
        );

        let shutdown = CancellationToken::new();
        let handle = spawn_cleanup_task(verifier, Duration::from_secs(60), shutdown.clone());

        let dead = VerificationRecord::issued(
            1,
            "t".into(),
            clock.now() - ChronoDuration::hours(48),
            ChronoDuration::hours(12),
        );
        store.upsert_record(&dead).await.expect("upsert");

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.record_count().await, 0);

        shutdown.cancel();
        handle.await.expect("task joins");
    }
}
