//! In-memory collaborators for unit tests.

use crate::error::{MetadataError, StorageError};
use crate::metadata_store::MetadataStore;
use crate::object_store::{public_url, ObjectStore};
use crate::publisher::{MockEventPublisher, PublishAck};
use crate::record::{ClaimOutcome, NewUpload, RecordUpdate, UploadRecord, UploadStatus};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

pub const BASE_URL: &str = "https://cdn.example.com";

/// Object store that keeps objects in a map and counts calls
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
    puts: AtomicUsize,
    deletes: Mutex<Vec<String>>,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
    gate: Option<Arc<Semaphore>>,
    put_started: Notify,
}

impl MemoryObjectStore {
    /// Store whose puts wait for a permit on the returned semaphore
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let store = Self {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        (store, gate)
    }

    pub fn failing() -> Self {
        let store = Self::default();
        store.fail_puts.store(true, Ordering::SeqCst);
        store
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn deleted_keys(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Resolves once a put has begun
    pub async fn wait_for_put(&self) {
        self.put_started.notified().await;
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<String, StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.put_started.notify_one();

        if let Some(ref gate) = self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| StorageError::Request(e.to_string()))?;
        }

        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Request("bucket unavailable".to_string()));
        }

        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(public_url(BASE_URL, key))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.deletes.lock().unwrap().push(key.to_string());

        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Request("delete refused".to_string()));
        }

        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Metadata store over a vector, with the same claim rules as Postgres
#[derive(Default)]
pub struct MemoryMetadataStore {
    records: Mutex<Vec<UploadRecord>>,
    /// Status updates to reject, with how many more times to reject them
    fail_on: Mutex<Vec<(UploadStatus, usize)>>,
    fail_lookups: AtomicBool,
}

impl MemoryMetadataStore {
    /// Make every update to `status` fail
    pub fn fail_updates_to(&self, status: UploadStatus) {
        self.fail_updates_to_times(status, usize::MAX);
    }

    /// Make the next `times` updates to `status` fail
    pub fn fail_updates_to_times(&self, status: UploadStatus, times: usize) {
        self.fail_on.lock().unwrap().push((status, times));
    }

    /// Push every record's timestamps `age` into the past
    pub fn age_records(&self, age: chrono::Duration) {
        for record in self.records.lock().unwrap().iter_mut() {
            record.created_at -= age;
            record.updated_at -= age;
        }
    }

    pub fn fail_lookups(&self) {
        self.fail_lookups.store(true, Ordering::SeqCst);
    }

    pub fn records_for(&self, fingerprint: &str) -> Vec<UploadRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.fingerprint == fingerprint)
            .cloned()
            .collect()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn seed(&self, record: UploadRecord) {
        self.records.lock().unwrap().push(record);
    }
}

fn unavailable() -> MetadataError {
    MetadataError::Database(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert_if_absent(&self, upload: &NewUpload) -> Result<ClaimOutcome, MetadataError> {
        let mut records = self.records.lock().unwrap();

        if let Some(active) = records
            .iter()
            .find(|r| r.fingerprint == upload.fingerprint && !r.status.is_failed())
        {
            return Ok(ClaimOutcome::Existing(active.clone()));
        }

        let now = Utc::now();
        let record = UploadRecord {
            id: Uuid::new_v4(),
            fingerprint: upload.fingerprint.clone(),
            original_name: upload.original_name.clone(),
            storage_key: None,
            url: None,
            size_bytes: upload.size_bytes,
            status: UploadStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        records.push(record.clone());

        Ok(ClaimOutcome::Created(record))
    }

    async fn update(&self, id: Uuid, update: &RecordUpdate) -> Result<(), MetadataError> {
        if let Some((_, remaining)) = self
            .fail_on
            .lock()
            .unwrap()
            .iter_mut()
            .find(|(status, remaining)| *status == update.status && *remaining > 0)
        {
            *remaining = remaining.saturating_sub(1);
            return Err(unavailable());
        }

        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| MetadataError::InvalidRow(format!("upload {id} does not exist")))?;

        if !record.apply(update) {
            return Err(MetadataError::InvalidRow(format!(
                "illegal transition {} -> {}",
                record.status, update.status
            )));
        }

        Ok(())
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<UploadRecord>, MetadataError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(unavailable());
        }

        let records = self.records.lock().unwrap();
        let active = records
            .iter()
            .find(|r| r.fingerprint == fingerprint && !r.status.is_failed());
        let latest = records.iter().rev().find(|r| r.fingerprint == fingerprint);

        Ok(active.or(latest).cloned())
    }
}

/// Publisher mock that acknowledges every event
pub fn accepting_publisher() -> MockEventPublisher {
    let mut publisher = MockEventPublisher::new();
    publisher.expect_publish().returning(|topic, _| {
        Ok(PublishAck {
            topic: topic.to_string(),
            partition: 0,
            offset: 1,
        })
    });
    publisher
}
