//! Error types for the upload pipeline.
//!
//! Each collaborator has its own error enum. The coordinator folds them into
//! [`UploadError`], whose `Display` output is what callers see, so it never
//! carries connection strings or driver messages. The collaborator error is
//! kept as the `source` for logging.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by an [`ObjectStore`](crate::object_store::ObjectStore)
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object store request failed: {0}")]
    Request(String),

    #[error("Object store timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors raised by a [`MetadataStore`](crate::metadata_store::MetadataStore)
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid upload row: {0}")]
    InvalidRow(String),

    #[error("Metadata store timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors raised by an [`EventPublisher`](crate::publisher::EventPublisher)
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to send event to topic {topic}: {message}")]
    Send { topic: String, message: String },

    #[error("Publisher timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome of a failed upload as reported to the caller
#[derive(Error, Debug)]
pub enum UploadError {
    /// Empty, oversized or otherwise unusable request
    #[error("{0}")]
    InvalidInput(String),

    /// Another upload of the same content is still in flight
    #[error("An upload of this file is already in progress, try again shortly")]
    Conflict,

    #[error("Upload failed: the file could not be stored")]
    Storage(#[source] StorageError),

    #[error("Upload failed: the file record could not be saved")]
    Metadata(#[source] MetadataError),

    /// The pipeline was torn down before it finished, e.g. on shutdown
    #[error("Upload interrupted before it completed, try again")]
    Interrupted,

    /// The file is stored and recorded; only the notification is missing
    #[error("File uploaded but the upload notification could not be sent")]
    Notify {
        url: String,
        #[source]
        source: NotifyError,
    },
}

impl UploadError {
    /// Whether resubmitting the same request can succeed
    pub fn is_retriable(&self) -> bool {
        !matches!(self, UploadError::InvalidInput(_))
    }

    /// URL of the stored file, when the failure left it usable
    pub fn url(&self) -> Option<&str> {
        match self {
            UploadError::Notify { url, .. } => Some(url),
            _ => None,
        }
    }

    /// Short stable code for logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::InvalidInput(_) => "invalid_input",
            UploadError::Conflict => "conflict",
            UploadError::Storage(_) => "storage",
            UploadError::Metadata(_) => "metadata",
            UploadError::Interrupted => "interrupted",
            UploadError::Notify { .. } => "notify",
        }
    }
}
