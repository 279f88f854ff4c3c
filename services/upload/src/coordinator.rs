//! Upload pipeline coordinator.
//!
//! Turns "store the bytes, record them, announce them" into one operation:
//!
//! ```text
//!  submit ─▶ fingerprint ─▶ lookup ──NOTIFIED──▶ deduped url
//!                              │
//!                              ▼
//!                        claim (PENDING) ──held by someone else──▶ Conflict
//!                              │
//!      ┌───────────────────────┘  runs to a terminal state even if the caller leaves
//!      ▼
//!  put object ──fail──▶ FAILED(store)
//!      │
//!      ▼
//!  STORED, PERSISTED ──fail──▶ FAILED(persist) + delete object
//!      │
//!      ▼
//!  publish event ──fail──▶ FAILED(notify), url still returned
//!      │
//!      ▼
//!  NOTIFIED
//! ```
//!
//! The metadata store's conditional insert is the only synchronization
//! point; the coordinator itself holds no cross-request state.
//!
//! Every collaborator call is bounded by the stage timeout, so a live pipeline
//! finishes within [`UploadCoordinator::stale_after`]. A non-terminal record
//! older than that was abandoned (crash, lost status write, a claim that
//! committed after its timeout) and the next submission of the same content
//! marks it failed and claims afresh.

use crate::config::Config;
use crate::error::{MetadataError, NotifyError, StorageError, UploadError};
use crate::metadata_store::MetadataStore;
use crate::object_store::ObjectStore;
use crate::publisher::{EventPublisher, UploadEvent};
use crate::record::{
    self, ClaimOutcome, FailedStage, NewUpload, RecordUpdate, UploadRecord, UploadStatus,
};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::{debug, error, info, instrument, warn, Instrument, Span};
use uuid::Uuid;

/// Attempts at a terminal status write before the record is left to go stale
const TERMINAL_WRITE_ATTEMPTS: u32 = 3;

/// Base delay between terminal write attempts, multiplied by the attempt number
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(100);

/// Stage timeouts a pipeline may spend before its claim counts as abandoned
const STALE_AFTER_STAGES: u32 = 10;

/// Claim attempts per submission; a stale holder is released between them
const CLAIM_ATTEMPTS: usize = 2;

/// Settings the coordinator needs from the service configuration
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Largest accepted upload in bytes
    pub max_upload_bytes: usize,
    /// Limit for every collaborator call
    pub stage_timeout: Duration,
    /// Topic upload events are published to
    pub notification_topic: String,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_upload_bytes: config.upload.max_upload_bytes,
            stage_timeout: config.stage_timeout(),
            notification_topic: config.kafka.notification_topic.clone(),
        }
    }
}

/// Successful upload as reported to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadOutcome {
    pub url: String,
    /// True when identical content had already been uploaded
    pub deduped: bool,
    pub record_id: Uuid,
}

/// Where a claim attempt landed
enum Claim {
    /// The fingerprint is ours and the record is `Pending`
    Won(UploadRecord),
    /// Identical content already completed
    Answered(UploadOutcome),
}

/// Runs the store → persist → notify pipeline for one upload
#[derive(Clone)]
pub struct UploadCoordinator {
    object_store: Arc<dyn ObjectStore>,
    metadata_store: Arc<dyn MetadataStore>,
    publisher: Arc<dyn EventPublisher>,
    settings: Arc<CoordinatorSettings>,
}

impl UploadCoordinator {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        metadata_store: Arc<dyn MetadataStore>,
        publisher: Arc<dyn EventPublisher>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            object_store,
            metadata_store,
            publisher,
            settings: Arc::new(settings),
        }
    }

    /// Store, record and announce an upload
    ///
    /// Identical content that already completed is answered from the
    /// existing record without touching the object store.
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    pub async fn submit(
        &self,
        bytes: Bytes,
        suggested_name: &str,
    ) -> Result<UploadOutcome, UploadError> {
        metrics::counter!("upload.submissions").increment(1);

        self.validate(&bytes)?;
        let fingerprint = record::fingerprint(&bytes);

        let existing = self
            .stage(
                self.metadata_store.find_by_fingerprint(&fingerprint),
                MetadataError::Timeout,
            )
            .await
            .map_err(|e| {
                error!(error = %e, fingerprint = %fingerprint, "Fingerprint lookup failed");
                UploadError::Metadata(e)
            })?;

        if let Some(existing) = existing {
            if let Some(outcome) = self.resolve_existing(&existing).await? {
                return Ok(outcome);
            }
            debug!(
                fingerprint = %fingerprint,
                previous = %existing.status,
                "Retrying previously failed or abandoned upload"
            );
        }

        let storage_key = record::storage_key(suggested_name, Utc::now());
        let claim = NewUpload {
            fingerprint,
            original_name: suggested_name.to_string(),
            size_bytes: bytes.len() as i64,
        };

        let record = match self.claim(&claim).await? {
            Claim::Won(record) => record,
            Claim::Answered(outcome) => return Ok(outcome),
        };

        info!(
            upload_id = %record.id,
            fingerprint = %record.fingerprint,
            storage_key = %storage_key,
            "Upload claimed"
        );

        // A claimed fingerprint must reach a terminal state, so the rest of
        // the pipeline runs detached from the caller's future.
        let coordinator = self.clone();
        let pipeline = tokio::spawn(
            async move { coordinator.run_pipeline(record, storage_key, bytes).await }
                .instrument(Span::current()),
        );

        pipeline_result(pipeline.await)
    }

    /// Claim a fingerprint, or answer from the record that holds it
    async fn claim(&self, claim: &NewUpload) -> Result<Claim, UploadError> {
        for _ in 0..CLAIM_ATTEMPTS {
            let existing = match self
                .stage(
                    self.metadata_store.insert_if_absent(claim),
                    MetadataError::Timeout,
                )
                .await
            {
                Ok(ClaimOutcome::Created(record)) => return Ok(Claim::Won(record)),
                Ok(ClaimOutcome::Existing(existing)) => existing,
                Err(e) => {
                    error!(error = %e, fingerprint = %claim.fingerprint, "Failed to claim fingerprint");
                    return Err(UploadError::Metadata(e));
                }
            };

            if let Some(outcome) = self.resolve_existing(&existing).await? {
                return Ok(Claim::Answered(outcome));
            }
        }

        metrics::counter!("upload.conflicts").increment(1);
        Err(UploadError::Conflict)
    }

    /// Current record for a fingerprint
    pub async fn find(&self, fingerprint: &str) -> Result<Option<UploadRecord>, UploadError> {
        self.stage(
            self.metadata_store.find_by_fingerprint(fingerprint),
            MetadataError::Timeout,
        )
        .await
        .map_err(UploadError::Metadata)
    }

    fn validate(&self, bytes: &Bytes) -> Result<(), UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::InvalidInput(
                "The uploaded file is empty".to_string(),
            ));
        }

        if bytes.len() > self.settings.max_upload_bytes {
            return Err(UploadError::InvalidInput(format!(
                "File exceeds the maximum upload size of {} bytes",
                self.settings.max_upload_bytes
            )));
        }

        Ok(())
    }

    async fn run_pipeline(
        &self,
        mut record: UploadRecord,
        storage_key: String,
        bytes: Bytes,
    ) -> Result<UploadOutcome, UploadError> {
        let started = Instant::now();
        let size_bytes = bytes.len();

        let url = match self
            .stage(
                self.object_store.put(&storage_key, bytes),
                StorageError::Timeout,
            )
            .await
        {
            Ok(url) => url,
            Err(e) => {
                error!(upload_id = %record.id, error = %e, "Object store write failed");
                self.mark_failed(&mut record, FailedStage::Store).await;
                return Err(UploadError::Storage(e));
            }
        };

        if let Err(e) = self.persist(&mut record, &storage_key, &url).await {
            error!(upload_id = %record.id, error = %e, "Failed to persist upload record");
            self.mark_failed(&mut record, FailedStage::Persist).await;
            self.compensate(&storage_key).await;
            return Err(UploadError::Metadata(e));
        }

        let event = UploadEvent::new(
            record.id,
            record.fingerprint.as_str(),
            url.as_str(),
            record.original_name.as_str(),
            record.size_bytes,
        );

        if let Err(e) = self
            .stage(
                self.publisher
                    .publish(&self.settings.notification_topic, &event),
                NotifyError::Timeout,
            )
            .await
        {
            error!(upload_id = %record.id, error = %e, "Failed to publish upload event");
            self.mark_failed(&mut record, FailedStage::Notify).await;
            return Err(UploadError::Notify { url, source: e });
        }

        // The event is out; a lost status write must not turn this into a failure.
        // The record then goes stale and is released by a later submission.
        if let Err(e) = self.settle(&mut record, UploadStatus::Notified).await {
            warn!(upload_id = %record.id, error = %e, "Failed to mark upload as notified");
        }

        metrics::counter!("upload.completed").increment(1);
        metrics::counter!("upload.bytes.stored").increment(size_bytes as u64);
        metrics::histogram!("upload.pipeline.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        info!(
            upload_id = %record.id,
            url = %url,
            size_bytes = size_bytes,
            "Upload completed"
        );

        Ok(UploadOutcome {
            url,
            deduped: false,
            record_id: record.id,
        })
    }

    async fn persist(
        &self,
        record: &mut UploadRecord,
        storage_key: &str,
        url: &str,
    ) -> Result<(), MetadataError> {
        self.transition(record, RecordUpdate::stored(storage_key, url))
            .await?;
        self.transition(record, RecordUpdate::status(UploadStatus::Persisted))
            .await
    }

    async fn transition(
        &self,
        record: &mut UploadRecord,
        update: RecordUpdate,
    ) -> Result<(), MetadataError> {
        debug_assert!(
            record.status.can_transition_to(update.status),
            "illegal transition {} -> {}",
            record.status,
            update.status
        );

        self.stage(
            self.metadata_store.update(record.id, &update),
            MetadataError::Timeout,
        )
        .await?;

        record.apply(&update);
        Ok(())
    }

    /// Record a failed stage; never masks the error that caused it
    async fn mark_failed(&self, record: &mut UploadRecord, stage: FailedStage) {
        metrics::counter!("upload.failed", "stage" => stage.as_str()).increment(1);

        if let Err(e) = self.settle(record, UploadStatus::Failed(stage)).await {
            error!(
                upload_id = %record.id,
                stage = stage.as_str(),
                error = %e,
                "Failed to record upload failure"
            );
        }
    }

    /// Write a terminal status, retrying a bounded number of times
    async fn settle(
        &self,
        record: &mut UploadRecord,
        status: UploadStatus,
    ) -> Result<(), MetadataError> {
        let update = RecordUpdate::status(status);
        let mut attempt = 1;

        loop {
            match self.transition(record, update.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                    warn!(
                        upload_id = %record.id,
                        status = %status,
                        attempt = attempt,
                        error = %e,
                        "Terminal status write failed, retrying"
                    );
                    tokio::time::sleep(TERMINAL_WRITE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Age past which a non-terminal record has no live pipeline behind it
    pub fn stale_after(&self) -> Duration {
        self.settings.stage_timeout * STALE_AFTER_STAGES
    }

    fn is_stale(&self, record: &UploadRecord) -> bool {
        let age = Utc::now().signed_duration_since(record.updated_at);
        age.to_std()
            .map(|age| age > self.stale_after())
            .unwrap_or(false)
    }

    /// Decide what an existing record means for a new submission
    ///
    /// `Ok(Some(_))` answers the caller from the record, `Ok(None)` means the
    /// record failed (or was just released as stale) and the upload should
    /// be retried.
    async fn resolve_existing(
        &self,
        existing: &UploadRecord,
    ) -> Result<Option<UploadOutcome>, UploadError> {
        match existing.status {
            UploadStatus::Notified => deduplicated(existing).map(Some),
            UploadStatus::Failed(_) => Ok(None),
            _ if self.is_stale(existing) => {
                self.release_stale(existing).await?;
                Ok(None)
            }
            status => {
                metrics::counter!("upload.conflicts").increment(1);
                debug!(
                    upload_id = %existing.id,
                    status = %status,
                    "Upload of identical content already in flight"
                );
                Err(UploadError::Conflict)
            }
        }
    }

    /// Mark an abandoned record failed at the stage it stopped in
    async fn release_stale(&self, existing: &UploadRecord) -> Result<(), UploadError> {
        let stage = match existing.status {
            UploadStatus::Pending => FailedStage::Store,
            UploadStatus::Stored => FailedStage::Persist,
            _ => FailedStage::Notify,
        };

        warn!(
            upload_id = %existing.id,
            status = %existing.status,
            updated_at = %existing.updated_at,
            "Releasing abandoned upload claim"
        );

        let update = RecordUpdate::status(UploadStatus::Failed(stage));
        match self
            .stage(
                self.metadata_store.update(existing.id, &update),
                MetadataError::Timeout,
            )
            .await
        {
            Ok(()) => {
                metrics::counter!("upload.released").increment(1);
                Ok(())
            }
            // Someone else released or finished it first; the claim decides
            Err(MetadataError::InvalidRow(reason)) => {
                debug!(upload_id = %existing.id, reason = %reason, "Stale claim already moved on");
                Ok(())
            }
            Err(e) => {
                error!(upload_id = %existing.id, error = %e, "Failed to release stale claim");
                Err(UploadError::Metadata(e))
            }
        }
    }

    /// Best-effort removal of an object whose record could not be saved
    async fn compensate(&self, storage_key: &str) {
        match self
            .stage(self.object_store.delete(storage_key), StorageError::Timeout)
            .await
        {
            Ok(()) => {
                metrics::counter!("upload.compensations").increment(1);
                info!(storage_key = %storage_key, "Removed object of failed upload");
            }
            Err(e) => {
                warn!(
                    storage_key = %storage_key,
                    error = %e,
                    "Compensating delete failed, object is orphaned"
                );
            }
        }
    }

    async fn stage<T, E, F>(&self, operation: F, on_timeout: fn(Duration) -> E) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let limit = self.settings.stage_timeout;

        match tokio::time::timeout(limit, operation).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(limit)),
        }
    }
}

/// Answer a submission from a completed record
fn deduplicated(existing: &UploadRecord) -> Result<UploadOutcome, UploadError> {
    let url = existing.url.clone().ok_or_else(|| {
        UploadError::Metadata(MetadataError::InvalidRow(format!(
            "notified upload {} has no url",
            existing.id
        )))
    })?;

    metrics::counter!("upload.deduped").increment(1);
    info!(
        upload_id = %existing.id,
        fingerprint = %existing.fingerprint,
        "Duplicate upload served from existing record"
    );

    Ok(UploadOutcome {
        url,
        deduped: true,
        record_id: existing.id,
    })
}

/// Unwrap the detached pipeline task
fn pipeline_result(
    joined: Result<Result<UploadOutcome, UploadError>, JoinError>,
) -> Result<UploadOutcome, UploadError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        // Only reachable while the runtime is shutting down
        Err(e) => {
            error!(error = %e, "Upload pipeline cancelled");
            Err(UploadError::Interrupted)
        }
    }
}
