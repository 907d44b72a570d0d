//! Token verification engine
//!
//! Issues per-user tokens, builds shortened verification deep links,
//! validates returning tokens and expires or purges dead records. Every
//! expected negative result is a [`ValidationOutcome`] value; only storage
//! faults surface as [`VerificationError`].

use crate::clock::{Clock, SystemClock};
use crate::config::{TokenPolicy, MAX_VERIFICATION_ATTEMPTS};
use crate::shortener::{shorten_or_fallback, Shortener};
use crate::storage::{
    PurgeCriteria, RecordUpdate, StorageError, VerificationRecord, VerificationStats,
    VerificationStore,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Periodic purge task
pub mod cleanup;

pub use cleanup::spawn_cleanup_task;

/// Deep link prefix of the verification round-trip
pub const VERIFY_PREFIX: &str = "verify_";

/// Faults raised by the engine
#[derive(Error, Debug)]
pub enum VerificationError {
    /// Underlying store failed
    #[error("verification store error: {0}")]
    Storage(#[from] StorageError),
}

/// Freshly issued token and the link that carries it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Opaque token stored in the user's record
    pub token: String,
    /// Shortened link, or the raw deep link if shortening failed
    pub link: String,
}

/// Result of checking a token returned through a verification link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Token matched; the record is now verified
    Verified {
        /// End of the validity window
        expires_at: DateTime<Utc>,
    },
    /// The record was already verified (repeated click)
    AlreadyVerified,
    /// No record exists for the user
    NoRecord,
    /// The record was past its window and has been deleted
    Expired,
    /// Token did not match; the attempt counter was incremented
    InvalidToken {
        /// Failed attempts so far
        attempts: u32,
    },
    /// A newer token replaced the record while this one was being checked
    Superseded,
}

impl ValidationOutcome {
    /// Whether the user may proceed
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Verified { .. } | Self::AlreadyVerified)
    }

    /// User-facing message. Never includes the stored token.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Verified { expires_at } => format!(
                "✅ Verification successful!\n\nYou now have access until {} UTC.",
                expires_at.format("%Y-%m-%d %H:%M")
            ),
            Self::AlreadyVerified => "✅ You are already verified.".to_string(),
            Self::NoRecord => {
                "❌ Verification not found.\nPlease request a new verification link.".to_string()
            }
            Self::Expired => {
                "⌛ Verification link expired.\nPlease request a new verification link."
                    .to_string()
            }
            Self::InvalidToken { .. } => {
                "❌ Invalid verification token.\nPlease use the latest link sent to you."
                    .to_string()
            }
            Self::Superseded => {
                "❌ A newer verification link was issued.\nPlease use the latest link sent to you."
                    .to_string()
            }
        }
    }
}

/// Builds the bot deep link for a verification round-trip
#[must_use]
pub fn verification_link(bot_username: &str, user_id: i64, token: &str) -> String {
    format!("https://t.me/{bot_username}?start={VERIFY_PREFIX}{user_id}_{token}")
}

/// Verification engine shared by every gated entry point
pub struct TokenVerifier {
    store: Arc<dyn VerificationStore>,
    shortener: Arc<dyn Shortener>,
    clock: Arc<dyn Clock>,
    policy: Arc<TokenPolicy>,
    bot_username: String,
}

impl TokenVerifier {
    /// Creates an engine using the system clock
    #[must_use]
    pub fn new(
        store: Arc<dyn VerificationStore>,
        shortener: Arc<dyn Shortener>,
        policy: Arc<TokenPolicy>,
        bot_username: impl Into<String>,
    ) -> Self {
        Self {
            store,
            shortener,
            clock: Arc::new(SystemClock),
            policy,
            bot_username: bot_username.into(),
        }
    }

    /// Replaces the time source
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Live policy handle, shared with admin commands
    #[must_use]
    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    /// Whether the token system is currently enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.policy.snapshot().enabled
    }

    /// Issues a new token for `user_id`, replacing any previous record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be stored. Shortener failures
    /// fall back to the unshortened link.
    pub async fn issue(&self, user_id: i64) -> Result<IssuedToken, VerificationError> {
        let token = Uuid::new_v4().to_string();
        let long_link = verification_link(&self.bot_username, user_id, &token);
        let link = shorten_or_fallback(self.shortener.as_ref(), &long_link).await;

        let policy = self.policy.snapshot();
        let record =
            VerificationRecord::issued(user_id, token.clone(), self.clock.now(), policy.validity());
        self.store.upsert_record(&record).await?;

        info!(
            "Issued verification token for user {} (valid {}h)",
            user_id, policy.validity_hours
        );
        Ok(IssuedToken { token, link })
    }

    /// Checks a token returned through a verification link.
    ///
    /// Repeated calls after success are idempotent and report
    /// [`ValidationOutcome::AlreadyVerified`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the store fails.
    pub async fn validate_and_consume(
        &self,
        user_id: i64,
        token: &str,
    ) -> Result<ValidationOutcome, VerificationError> {
        let Some(record) = self.store.get_record(user_id).await? else {
            debug!("No verification record for user {}", user_id);
            return Ok(ValidationOutcome::NoRecord);
        };

        let now = self.clock.now();
        if record.is_expired(now) {
            self.store.delete_record(user_id).await?;
            info!("Verification record for user {} expired", user_id);
            return Ok(ValidationOutcome::Expired);
        }

        if record.is_verified {
            return Ok(ValidationOutcome::AlreadyVerified);
        }

        if record.token != token {
            let updated = self
                .store
                .update_record(user_id, RecordUpdate::FailedAttempt)
                .await?;
            return Ok(updated.map_or(ValidationOutcome::NoRecord, |r| {
                warn!(
                    "Invalid verification token for user {} (attempt {})",
                    user_id, r.verification_attempts
                );
                ValidationOutcome::InvalidToken {
                    attempts: r.verification_attempts,
                }
            }));
        }

        let updated = self
            .store
            .update_record(
                user_id,
                RecordUpdate::Verified {
                    at: now,
                    token: token.to_string(),
                },
            )
            .await?;
        Ok(match updated {
            None => ValidationOutcome::NoRecord,
            Some(r) if !r.is_verified => {
                info!("Verification token for user {} was replaced mid-check", user_id);
                ValidationOutcome::Superseded
            }
            Some(r) => {
                info!("User {} verified until {}", user_id, r.expires_at);
                ValidationOutcome::Verified {
                    expires_at: r.expires_at,
                }
            }
        })
    }

    /// Hot-path access check: one read and at most one write.
    ///
    /// Always true while the token system is disabled, without touching the
    /// store. Expired records are deleted as a side effect.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn check_access(&self, user_id: i64) -> Result<bool, VerificationError> {
        if !self.is_enabled() {
            return Ok(true);
        }

        let Some(record) = self.store.get_record(user_id).await? else {
            return Ok(false);
        };

        let now = self.clock.now();
        if record.is_expired(now) {
            self.store.delete_record(user_id).await?;
            info!("Verification for user {} expired, record removed", user_id);
            return Ok(false);
        }
        if !record.is_verified {
            return Ok(false);
        }

        let touched = self
            .store
            .update_record(user_id, RecordUpdate::Touched { at: now })
            .await?;
        Ok(touched.is_some())
    }

    /// Deletes expired, attempt-exhausted and stale verified records.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn cleanup_expired(&self) -> Result<u64, VerificationError> {
        let criteria = PurgeCriteria {
            now: self.clock.now(),
            window: self.policy.snapshot().validity(),
            max_attempts: MAX_VERIFICATION_ATTEMPTS,
        };
        let removed = self.store.purge_records(&criteria).await?;
        if removed > 0 {
            info!("Verification cleanup removed {} records", removed);
        }
        Ok(removed)
    }

    /// Marks a user verified without the link flow (admin override)
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn grant(&self, user_id: i64) -> Result<VerificationRecord, VerificationError> {
        let now = self.clock.now();
        let mut record = VerificationRecord::issued(
            user_id,
            Uuid::new_v4().to_string(),
            now,
            self.policy.snapshot().validity(),
        );
        record.apply(&RecordUpdate::Verified {
            at: now,
            token: record.token.clone(),
        });
        self.store.upsert_record(&record).await?;
        info!("User {} manually verified", user_id);
        Ok(record)
    }

    /// Deletes a user's record; returns whether one existed
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn revoke(&self, user_id: i64) -> Result<bool, VerificationError> {
        let removed = self.store.delete_record(user_id).await?;
        if removed {
            info!("User {} manually unverified", user_id);
        }
        Ok(removed)
    }

    /// Total and currently active records
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn stats(&self) -> Result<VerificationStats, VerificationError> {
        Ok(self.store.verification_stats(self.clock.now()).await?)
    }
}
