use super::{
    FileRegistry, PurgeCriteria, RecordUpdate, StorageError, StoredBatch, StoredFile,
    VerificationRecord, VerificationStats, VerificationStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process storage backend.
///
/// Every operation holds the relevant lock for its whole duration, so
/// update-or-delete calls are atomic per record. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<i64, VerificationRecord>>,
    files: RwLock<HashMap<String, StoredFile>>,
    batches: RwLock<HashMap<String, StoredBatch>>,
}

impl MemoryStorage {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored verification records
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl VerificationStore for MemoryStorage {
    async fn get_record(&self, user_id: i64) -> Result<Option<VerificationRecord>, StorageError> {
        Ok(self.records.read().await.get(&user_id).cloned())
    }

    async fn upsert_record(&self, record: &VerificationRecord) -> Result<(), StorageError> {
        self.records
            .write()
            .await
            .insert(record.user_id, record.clone());
        Ok(())
    }

    async fn delete_record(&self, user_id: i64) -> Result<bool, StorageError> {
        Ok(self.records.write().await.remove(&user_id).is_some())
    }

    async fn update_record(
        &self,
        user_id: i64,
        update: RecordUpdate,
    ) -> Result<Option<VerificationRecord>, StorageError> {
        let mut records = self.records.write().await;
        Ok(records.get_mut(&user_id).map(|record| {
            record.apply(&update);
            record.clone()
        }))
    }

    async fn purge_records(&self, criteria: &PurgeCriteria) -> Result<u64, StorageError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !criteria.matches(record));
        Ok((before - records.len()) as u64)
    }

    async fn verification_stats(
        &self,
        now: DateTime<Utc>,
    ) -> Result<VerificationStats, StorageError> {
        let records = self.records.read().await;
        Ok(VerificationStats {
            total: records.len() as u64,
            active: records.values().filter(|r| r.expires_at > now).count() as u64,
        })
    }

    async fn check_connection(&self) -> Result<(), String> {
        Ok(())
    }
}

#[async_trait]
impl FileRegistry for MemoryStorage {
    async fn get_file(&self, uuid: &str) -> Result<Option<StoredFile>, StorageError> {
        Ok(self.files.read().await.get(uuid).cloned())
    }

    async fn get_batch(&self, uuid: &str) -> Result<Option<StoredBatch>, StorageError> {
        Ok(self.batches.read().await.get(uuid).cloned())
    }

    async fn save_file(&self, file: &StoredFile) -> Result<(), StorageError> {
        self.files
            .write()
            .await
            .insert(file.uuid.clone(), file.clone());
        Ok(())
    }

    async fn save_batch(&self, batch: &StoredBatch) -> Result<(), StorageError> {
        self.batches
            .write()
            .await
            .insert(batch.uuid.clone(), batch.clone());
        Ok(())
    }

    async fn increment_downloads(&self, uuid: &str) -> Result<(), StorageError> {
        if let Some(file) = self.files.write().await.get_mut(uuid) {
            file.downloads += 1;
        }
        Ok(())
    }

    async fn increment_batch_downloads(&self, uuid: &str) -> Result<(), StorageError> {
        if let Some(batch) = self.batches.write().await.get_mut(uuid) {
            batch.downloads += 1;
        }
        Ok(())
    }
}
