//! Filerelay Upload Service
//!
//! Accepts browser file uploads, stores them in S3, records them in
//! PostgreSQL and announces them on Kafka. The three writes behave as one
//! operation: identical content is deduplicated by fingerprint, a failed
//! attempt can simply be resubmitted, and a file whose record could not be
//! saved is removed again.
//!
//! ## Architecture
//!
//! ```text
//!  Browser form            Upload Service                    Collaborators
//! ┌─────────────┐  POST   ┌──────────────┐
//! │ multipart   │────────▶│ api          │
//! │ file field  │◀────────│ (axum)       │
//! └─────────────┘  JSON   └──────────────┘
//!                                │
//!                                ▼
//!                         ┌──────────────┐  put/delete  ┌──────────────┐
//!                         │ Upload       │─────────────▶│ S3 bucket    │
//!                         │ Coordinator  │              └──────────────┘
//!                         │              │  claim/update┌──────────────┐
//!                         │              │─────────────▶│ PostgreSQL   │
//!                         │              │              │ uploads      │
//!                         │              │  publish     └──────────────┘
//!                         │              │─────────────▶┌──────────────┐
//!                         └──────────────┘              │ Kafka topic  │
//!                                                       └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metadata_store;
pub mod object_store;
pub mod publisher;
pub mod record;

#[cfg(test)]
mod testing;

pub use api::{AppState, UploadResponse};
pub use config::Config;
pub use coordinator::{CoordinatorSettings, UploadCoordinator, UploadOutcome};
pub use error::{MetadataError, NotifyError, StorageError, UploadError};
pub use metadata_store::{MetadataStore, PgMetadataStore};
pub use object_store::{ObjectStore, S3ObjectStore};
pub use publisher::{EventPublisher, KafkaEventPublisher, UploadEvent};
pub use record::{FailedStage, UploadRecord, UploadStatus};
