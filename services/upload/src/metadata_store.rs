use crate::config::DatabaseConfig;
use crate::error::MetadataError;
use crate::record::{ClaimOutcome, NewUpload, RecordUpdate, UploadRecord, UploadStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Claims are retried when the competing record fails between our insert and lookup
const CLAIM_ATTEMPTS: usize = 3;

const UPLOAD_COLUMNS: &str = "id, fingerprint, original_name, storage_key, url, size_bytes, \
                              status, failed_stage, created_at, updated_at";

/// Source of truth for upload records and fingerprint claims
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Atomically create a `Pending` record unless a non-failed record
    /// already holds the fingerprint
    async fn insert_if_absent(&self, upload: &NewUpload) -> Result<ClaimOutcome, MetadataError>;

    /// Apply a status transition to a record
    ///
    /// Fails with [`MetadataError::InvalidRow`] when the record is missing or
    /// its current status cannot move to `update.status`.
    async fn update(&self, id: Uuid, update: &RecordUpdate) -> Result<(), MetadataError>;

    /// Current record for a fingerprint, preferring the non-failed one
    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<UploadRecord>, MetadataError>;

    /// Connectivity check for readiness probes
    async fn ping(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}

/// Row of the `uploads` table
#[derive(Debug, Clone, FromRow)]
struct UploadRow {
    id: Uuid,
    fingerprint: String,
    original_name: String,
    storage_key: Option<String>,
    url: Option<String>,
    size_bytes: i64,
    status: String,
    failed_stage: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UploadRow> for UploadRecord {
    type Error = MetadataError;

    fn try_from(row: UploadRow) -> Result<Self, Self::Error> {
        let status = UploadStatus::from_columns(&row.status, row.failed_stage.as_deref())
            .ok_or_else(|| {
                MetadataError::InvalidRow(format!(
                    "upload {} has unknown status {:?}/{:?}",
                    row.id, row.status, row.failed_stage
                ))
            })?;

        Ok(UploadRecord {
            id: row.id,
            fingerprint: row.fingerprint,
            original_name: row.original_name,
            storage_key: row.storage_key,
            url: row.url,
            size_bytes: row.size_bytes,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// `status` values an update to `next` may overwrite
fn predecessor_columns(next: UploadStatus) -> Vec<String> {
    next.predecessors().iter().map(|s| s.to_string()).collect()
}

/// PostgreSQL-backed metadata store
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    async fn try_insert(&self, upload: &NewUpload) -> Result<Option<UploadRow>, MetadataError> {
        // The partial unique index only covers non-failed rows, so a failed
        // attempt never blocks a new claim.
        let sql = format!(
            r#"
            INSERT INTO uploads (id, fingerprint, original_name, size_bytes, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', NOW(), NOW())
            ON CONFLICT (fingerprint) WHERE status <> 'failed' DO NOTHING
            RETURNING {UPLOAD_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, UploadRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&upload.fingerprint)
            .bind(&upload.original_name)
            .bind(upload.size_bytes)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn find_active(&self, fingerprint: &str) -> Result<Option<UploadRow>, MetadataError> {
        let sql = format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE fingerprint = $1 AND status <> 'failed'"
        );

        let row = sqlx::query_as::<_, UploadRow>(&sql)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    #[instrument(skip(self, upload), fields(fingerprint = %upload.fingerprint))]
    async fn insert_if_absent(&self, upload: &NewUpload) -> Result<ClaimOutcome, MetadataError> {
        for _ in 0..CLAIM_ATTEMPTS {
            if let Some(row) = self.try_insert(upload).await? {
                debug!(upload_id = %row.id, "Fingerprint claimed");
                return Ok(ClaimOutcome::Created(row.try_into()?));
            }

            if let Some(row) = self.find_active(&upload.fingerprint).await? {
                return Ok(ClaimOutcome::Existing(row.try_into()?));
            }
        }

        Err(MetadataError::InvalidRow(format!(
            "claim on {} kept racing with concurrent failures",
            upload.fingerprint
        )))
    }

    #[instrument(skip(self, update), fields(status = %update.status))]
    async fn update(&self, id: Uuid, update: &RecordUpdate) -> Result<(), MetadataError> {
        let result = sqlx::query(
            r#"
            UPDATE uploads
            SET status = $2,
                failed_stage = $3,
                storage_key = COALESCE(storage_key, $4),
                url = COALESCE(url, $5),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($6)
            "#,
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.status.failed_stage().map(|stage| stage.as_str()))
        .bind(&update.storage_key)
        .bind(&update.url)
        .bind(predecessor_columns(update.status))
        .execute(&self.pool)
        .await?;

        // Either the row is gone or it is not in a status that may move forward
        if result.rows_affected() == 0 {
            return Err(MetadataError::InvalidRow(format!(
                "upload {id} does not exist or cannot move to {}",
                update.status
            )));
        }

        Ok(())
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<UploadRecord>, MetadataError> {
        let sql = format!(
            r#"
            SELECT {UPLOAD_COLUMNS}
            FROM uploads
            WHERE fingerprint = $1
            ORDER BY (status = 'failed') ASC, created_at DESC
            LIMIT 1
            "#
        );

        let row = sqlx::query_as::<_, UploadRow>(&sql)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;

        row.map(UploadRecord::try_from).transpose()
    }

    async fn ping(&self) -> Result<(), MetadataError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
