//! Storage layer for verification records and the file registry
//!
//! Two backends implement the same traits: Cloudflare R2 / AWS S3 for
//! production and an in-process map for local runs and tests.

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// In-process backend
pub mod memory;
/// R2 / S3 backend
pub mod r2;

pub use memory::MemoryStorage;
pub use r2::R2Storage;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Error retrieving object from S3
    #[error("S3 Get error: {0}")]
    S3Get(Box<SdkError<GetObjectError>>),
    /// Error putting or deleting an object in S3
    #[error("S3 put error: {0}")]
    S3Put(String),
    /// Error listing objects in S3
    #[error("S3 list error: {0}")]
    S3List(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration error (missing credentials, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
    /// A conditional write kept losing to concurrent writers
    #[error("Object {0} changed concurrently, giving up")]
    Conflict(String),
}

/// Per-user verification state
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VerificationRecord {
    /// Telegram user ID, unique key
    pub user_id: i64,
    /// Token expected back from the verification link
    pub token: String,
    /// When the token was issued
    pub created_at: DateTime<Utc>,
    /// `created_at` plus one validity window
    pub expires_at: DateTime<Utc>,
    /// Set once the user completed the link flow
    #[serde(default)]
    pub is_verified: bool,
    /// When the user completed the link flow
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    /// Failed token checks against this record
    #[serde(default)]
    pub verification_attempts: u32,
    /// Last successful access check
    pub last_activity: DateTime<Utc>,
}

impl VerificationRecord {
    /// Builds a fresh, unverified record valid for `validity`.
    ///
    /// A window reaching past the representable range ends at
    /// `DateTime::<Utc>::MAX_UTC`.
    #[must_use]
    pub fn issued(user_id: i64, token: String, now: DateTime<Utc>, validity: Duration) -> Self {
        Self {
            user_id,
            token,
            created_at: now,
            expires_at: now
                .checked_add_signed(validity)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            is_verified: false,
            verified_at: None,
            verification_attempts: 0,
            last_activity: now,
        }
    }

    /// Expiry is strict: a record expiring exactly at `now` is still valid
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Applies a single-record mutation.
    ///
    /// `Verified` is a no-op unless its token matches the stored one.
    pub fn apply(&mut self, update: &RecordUpdate) {
        match update {
            RecordUpdate::FailedAttempt => {
                self.verification_attempts = self.verification_attempts.saturating_add(1);
            }
            RecordUpdate::Verified { at, token } => {
                if *token == self.token {
                    self.is_verified = true;
                    self.verified_at = Some(*at);
                    self.last_activity = *at;
                }
            }
            RecordUpdate::Touched { at } => {
                self.last_activity = *at;
            }
        }
    }
}

/// Mutation applied to an existing record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordUpdate {
    /// Increment the failed attempt counter
    FailedAttempt,
    /// Mark the record verified at the given instant, if it still holds
    /// `token`
    Verified {
        /// Verification instant
        at: DateTime<Utc>,
        /// Token the caller validated
        token: String,
    },
    /// Refresh `last_activity`
    Touched {
        /// Activity instant
        at: DateTime<Utc>,
    },
}

/// Predicate selecting records eligible for bulk deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeCriteria {
    /// Reference instant
    pub now: DateTime<Utc>,
    /// One validity window
    pub window: Duration,
    /// Attempt budget; records at or above it are purged
    pub max_attempts: u32,
}

impl PurgeCriteria {
    /// Expired, out of attempts, or verified but idle for a whole window
    #[must_use]
    pub fn matches(&self, record: &VerificationRecord) -> bool {
        record.is_expired(self.now)
            || record.verification_attempts >= self.max_attempts
            || (record.is_verified
                && self
                    .now
                    .checked_sub_signed(self.window)
                    .is_some_and(|cutoff| record.last_activity < cutoff))
    }
}

/// Aggregate counts for the admin statistics command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerificationStats {
    /// All stored records
    pub total: u64,
    /// Records with `expires_at` in the future
    pub active: u64,
}

/// Durable key-value store of verification records keyed by user ID
#[async_trait]
pub trait VerificationStore: Send + Sync {
    /// Load a user's record
    async fn get_record(&self, user_id: i64) -> Result<Option<VerificationRecord>, StorageError>;
    /// Insert or replace a user's record
    async fn upsert_record(&self, record: &VerificationRecord) -> Result<(), StorageError>;
    /// Delete a user's record; returns whether one existed
    async fn delete_record(&self, user_id: i64) -> Result<bool, StorageError>;
    /// Apply `update` to an existing record and return the result
    async fn update_record(
        &self,
        user_id: i64,
        update: RecordUpdate,
    ) -> Result<Option<VerificationRecord>, StorageError>;
    /// Delete every record matching `criteria`; returns how many were deleted
    async fn purge_records(&self, criteria: &PurgeCriteria) -> Result<u64, StorageError>;
    /// Count total and active records
    async fn verification_stats(
        &self,
        now: DateTime<Utc>,
    ) -> Result<VerificationStats, StorageError>;
    /// Check connection to storage
    async fn check_connection(&self) -> Result<(), String>;
}

/// A stored file, relayed from the private channel
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Public identifier used in deep links
    pub uuid: String,
    /// Message ID in the relay channel
    pub message_id: i32,
    /// Download counter
    #[serde(default)]
    pub downloads: u64,
}

/// A named group of stored files
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StoredBatch {
    /// Public identifier used in `batch_<uuid>` links
    pub uuid: String,
    /// Member file identifiers, in delivery order
    pub files: Vec<String>,
    /// Download counter
    #[serde(default)]
    pub downloads: u64,
}

/// File and batch registry
#[async_trait]
pub trait FileRegistry: Send + Sync {
    /// Look up a file by identifier
    async fn get_file(&self, uuid: &str) -> Result<Option<StoredFile>, StorageError>;
    /// Look up a batch by identifier
    async fn get_batch(&self, uuid: &str) -> Result<Option<StoredBatch>, StorageError>;
    /// Register or replace a file
    async fn save_file(&self, file: &StoredFile) -> Result<(), StorageError>;
    /// Register or replace a batch
    async fn save_batch(&self, batch: &StoredBatch) -> Result<(), StorageError>;
    /// Bump a file's download counter
    async fn increment_downloads(&self, uuid: &str) -> Result<(), StorageError>;
    /// Bump a batch's download counter
    async fn increment_batch_downloads(&self, uuid: &str) -> Result<(), StorageError>;
}

/// Returns the storage key for a user's verification record
#[must_use]
pub fn verification_key(user_id: i64) -> String {
    format!("{VERIFICATION_PREFIX}{user_id}.json")
}

/// Returns the storage key for a stored file
#[must_use]
pub fn file_key(uuid: &str) -> String {
    format!("files/{uuid}.json")
}

/// Returns the storage key for a stored batch
#[must_use]
pub fn batch_key(uuid: &str) -> String {
    format!("batches/{uuid}.json")
}

/// Key prefix shared by all verification records
pub const VERIFICATION_PREFIX: &str = "verification/";
