use super::{
    batch_key, file_key, verification_key, FileRegistry, PurgeCriteria, RecordUpdate,
    StorageError, StoredBatch, StoredFile, VerificationRecord, VerificationStats,
    VerificationStore, VERIFICATION_PREFIX,
};
use crate::config::Settings;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt, TryStreamExt};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Concurrent object operations during bulk scans
const SCAN_CONCURRENCY: usize = 16;

/// Read-modify-write rounds before a contended update gives up
const CONDITIONAL_WRITE_ATTEMPTS: usize = 5;

/// Whether a failed conditional put lost a race rather than broke.
///
/// 412 means the ETag moved, 409 a concurrent conditional write and 404
/// that the object was deleted since it was read.
const fn is_write_conflict(status: Option<u16>) -> bool {
    matches!(status, Some(404 | 409 | 412))
}

/// R2-backed storage implementation.
///
/// Each record is one JSON object. Reads go through a short-lived cache that
/// is updated on every write and invalidated on every delete. Updates of an
/// existing object bypass the cache and are guarded by its ETag.
pub struct R2Storage {
    client: Client,
    bucket: String,
    cache: Cache<String, Arc<Vec<u8>>>,
}

impl R2Storage {
    /// Create a new R2 storage instance
    ///
    /// # Errors
    ///
    /// Returns an error if R2 configuration is missing.
    pub async fn new(settings: &Settings) -> Result<Self, StorageError> {
        let endpoint_url = settings
            .r2_endpoint_url
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_ENDPOINT_URL is missing".into()))?;
        let access_key = settings
            .r2_access_key_id
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_ACCESS_KEY_ID is missing".into()))?;
        let secret_key = settings
            .r2_secret_access_key
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_SECRET_ACCESS_KEY is missing".into()))?;
        let bucket = settings
            .r2_bucket_name
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_BUCKET_NAME is missing".into()))?;

        let credentials = Credentials::new(access_key, secret_key, None, None, "r2-storage");

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("auto"))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(endpoint_url)
            .force_path_style(true)
            .build();

        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(10 * 60))
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: bucket.clone(),
            cache,
        })
    }

    /// Save data as JSON to R2
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization or S3 upload fails.
    pub async fn save_json<T: serde::Serialize + Sync>(
        &self,
        key: &str,
        data: &T,
    ) -> Result<(), StorageError> {
        let body = serde_json::to_vec(data)?;
        if self.put_bytes(key, body, None).await? {
            Ok(())
        } else {
            Err(StorageError::Conflict(key.to_string()))
        }
    }

    /// Put `body` under `key`, only over the version `if_match` when given.
    ///
    /// Returns `false` when the precondition failed.
    async fn put_bytes(
        &self,
        key: &str,
        body: Vec<u8>,
        if_match: Option<String>,
    ) -> Result<bool, StorageError> {
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body.clone()))
            .content_type("application/json")
            .set_if_match(if_match)
            .send()
            .await;

        match result {
            Ok(_) => {
                // Only cache what R2 accepted
                self.cache.insert(key.to_string(), Arc::new(body)).await;
                Ok(true)
            }
            Err(e) if is_write_conflict(e.raw_response().map(|r| r.status().as_u16())) => {
                self.cache.invalidate(key).await;
                Ok(false)
            }
            Err(e) => Err(StorageError::S3Put(e.to_string())),
        }
    }

    /// Load `key` straight from R2 together with its ETag
    async fn load_versioned<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<(T, Option<String>)>, StorageError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let etag = output.e_tag().map(str::to_string);
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
                    .into_bytes();
                Ok(Some((serde_json::from_slice(&data)?, etag)))
            }
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => Ok(None),
            Err(e) => Err(StorageError::S3Get(Box::new(e))),
        }
    }

    /// Load data from JSON in R2
    ///
    /// # Errors
    ///
    /// Returns an error if S3 download or JSON deserialization fails.
    pub async fn load_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        if let Some(cached) = self.cache.get(key).await {
            match serde_json::from_slice(&cached) {
                Ok(data) => return Ok(Some(data)),
                Err(e) => {
                    warn!("Cache deserialization failed for {}: {}", key, e);
                    self.cache.invalidate(key).await;
                }
            }
        }

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
                    .into_bytes();

                let parsed = serde_json::from_slice(&data)?;
                self.cache
                    .insert(key.to_string(), Arc::new(data.to_vec()))
                    .await;
                Ok(Some(parsed))
            }
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => Ok(None),
            Err(e) => Err(StorageError::S3Get(Box::new(e))),
        }
    }

    /// Delete object from R2
    ///
    /// # Errors
    ///
    /// Returns an error if S3 deletion fails.
    pub async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.cache.invalidate(key).await;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::S3Put(e.to_string()))?;

        Ok(())
    }

    /// List all object keys under `prefix`
    ///
    /// # Errors
    ///
    /// Returns an error if any listing page fails.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| StorageError::S3List(e.to_string()))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
        }
        Ok(keys)
    }

    /// Load every verification record, skipping objects that vanished mid-scan
    async fn load_all_records(&self) -> Result<Vec<VerificationRecord>, StorageError> {
        let keys = self.list_keys(VERIFICATION_PREFIX).await?;
        stream::iter(keys)
            .map(|key| async move { self.load_json::<VerificationRecord>(&key).await })
            .buffer_unordered(SCAN_CONCURRENCY)
            .try_filter_map(|record| async move { Ok(record) })
            .try_collect()
            .await
    }

    /// Apply `modifier` to the object at `key` with an ETag-guarded put.
    ///
    /// A lost race reloads and reapplies. A missing object yields `None`.
    async fn modify_json<T, F>(
        &self,
        key: &str,
        mut modifier: F,
    ) -> Result<Option<T>, StorageError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync,
        F: FnMut(&mut T) + Send,
    {
        for attempt in 1..=CONDITIONAL_WRITE_ATTEMPTS {
            let Some((mut value, etag)) = self.load_versioned::<T>(key).await? else {
                self.cache.invalidate(key).await;
                return Ok(None);
            };
            if etag.is_none() {
                warn!("R2 returned no ETag for {}; writing unconditionally", key);
            }
            modifier(&mut value);
            let body = serde_json::to_vec(&value)?;
            if self.put_bytes(key, body, etag).await? {
                return Ok(Some(value));
            }
            debug!("Concurrent write to {} (attempt {})", key, attempt);
        }
        Err(StorageError::Conflict(key.to_string()))
    }
}

#[async_trait]
impl VerificationStore for R2Storage {
    async fn get_record(&self, user_id: i64) -> Result<Option<VerificationRecord>, StorageError> {
        self.load_json(&verification_key(user_id)).await
    }

    async fn upsert_record(&self, record: &VerificationRecord) -> Result<(), StorageError> {
        self.save_json(&verification_key(record.user_id), record)
            .await
    }

    async fn delete_record(&self, user_id: i64) -> Result<bool, StorageError> {
        let key = verification_key(user_id);
        let existed = self.load_json::<VerificationRecord>(&key).await?.is_some();
        if existed {
            self.delete_object(&key).await?;
        }
        Ok(existed)
    }

    async fn update_record(
        &self,
        user_id: i64,
        update: RecordUpdate,
    ) -> Result<Option<VerificationRecord>, StorageError> {
        self.modify_json(&verification_key(user_id), |record: &mut VerificationRecord| {
            record.apply(&update);
        })
        .await
    }

    async fn purge_records(&self, criteria: &PurgeCriteria) -> Result<u64, StorageError> {
        let doomed: Vec<i64> = self
            .load_all_records()
            .await?
            .into_iter()
            .filter(|record| criteria.matches(record))
            .map(|record| record.user_id)
            .collect();

        let deleted = doomed.len() as u64;
        stream::iter(doomed)
            .map(|user_id| async move { self.delete_object(&verification_key(user_id)).await })
            .buffer_unordered(SCAN_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;

        debug!("Purged {} verification objects from R2", deleted);
        Ok(deleted)
    }

    async fn verification_stats(
        &self,
        now: DateTime<Utc>,
    ) -> Result<VerificationStats, StorageError> {
        let records = self.load_all_records().await?;
        Ok(VerificationStats {
            total: records.len() as u64,
            active: records.iter().filter(|r| r.expires_at > now).count() as u64,
        })
    }

    async fn check_connection(&self) -> Result<(), String> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!("Successfully connected to R2 storage.");
                Ok(())
            }
            Err(e) => {
                let err_msg = format!("R2 connectivity test failed: {e:#?}");
                error!("{}", err_msg);
                Err(err_msg)
            }
        }
    }
}

#[async_trait]
impl FileRegistry for R2Storage {
    async fn get_file(&self, uuid: &str) -> Result<Option<StoredFile>, StorageError> {
        self.load_json(&file_key(uuid)).await
    }

    async fn get_batch(&self, uuid: &str) -> Result<Option<StoredBatch>, StorageError> {
        self.load_json(&batch_key(uuid)).await
    }

    async fn save_file(&self, file: &StoredFile) -> Result<(), StorageError> {
        self.save_json(&file_key(&file.uuid), file).await
    }

    async fn save_batch(&self, batch: &StoredBatch) -> Result<(), StorageError> {
        self.save_json(&batch_key(&batch.uuid), batch).await
    }

    async fn increment_downloads(&self, uuid: &str) -> Result<(), StorageError> {
        self.modify_json(&file_key(uuid), |file: &mut StoredFile| file.downloads += 1)
            .await
            .map(|_| ())
    }

    async fn increment_batch_downloads(&self, uuid: &str) -> Result<(), StorageError> {
        self.modify_json(&batch_key(uuid), |batch: &mut StoredBatch| {
            batch.downloads += 1;
        })
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_races_are_told_apart_from_failures() {
        assert!(is_write_conflict(Some(412)));
        assert!(is_write_conflict(Some(409)));
        assert!(is_write_conflict(Some(404)));
        assert!(!is_write_conflict(Some(403)));
        assert!(!is_write_conflict(Some(500)));
        assert!(!is_write_conflict(None));
    }
}
