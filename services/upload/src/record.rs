//! Upload records and the naming rules applied to uploaded files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Name used when nothing usable is left of the caller's file name
const FALLBACK_FILE_NAME: &str = "upload";

/// Longest sanitized file name kept in a storage key
const MAX_FILE_NAME_CHARS: usize = 128;

/// Pipeline stage an upload failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStage {
    /// Object store write
    Store,
    /// Metadata persistence
    Persist,
    /// Notification publish
    Notify,
}

impl FailedStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailedStage::Store => "store",
            FailedStage::Persist => "persist",
            FailedStage::Notify => "notify",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "store" => Some(FailedStage::Store),
            "persist" => Some(FailedStage::Persist),
            "notify" => Some(FailedStage::Notify),
            _ => None,
        }
    }
}

/// Lifecycle status of an upload
///
/// The success path is `Pending -> Stored -> Persisted -> Notified`. Any
/// non-terminal status may move to `Failed`, after which nothing changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "stage")]
pub enum UploadStatus {
    Pending,
    Stored,
    Persisted,
    Notified,
    Failed(FailedStage),
}

impl UploadStatus {
    /// Value of the `status` column
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Stored => "stored",
            UploadStatus::Persisted => "persisted",
            UploadStatus::Notified => "notified",
            UploadStatus::Failed(_) => "failed",
        }
    }

    /// Value of the `failed_stage` column
    pub fn failed_stage(&self) -> Option<FailedStage> {
        match self {
            UploadStatus::Failed(stage) => Some(*stage),
            _ => None,
        }
    }

    /// Rebuild a status from its `status` and `failed_stage` columns
    pub fn from_columns(status: &str, failed_stage: Option<&str>) -> Option<Self> {
        match status {
            "pending" => Some(UploadStatus::Pending),
            "stored" => Some(UploadStatus::Stored),
            "persisted" => Some(UploadStatus::Persisted),
            "notified" => Some(UploadStatus::Notified),
            "failed" => failed_stage
                .and_then(FailedStage::parse)
                .map(UploadStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Notified | UploadStatus::Failed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, UploadStatus::Failed(_))
    }

    /// Whether `next` is a legal move from this status
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        match (self, next) {
            (UploadStatus::Pending, UploadStatus::Stored) => true,
            (UploadStatus::Stored, UploadStatus::Persisted) => true,
            (UploadStatus::Persisted, UploadStatus::Notified) => true,
            (current, UploadStatus::Failed(_)) => !current.is_terminal(),
            _ => false,
        }
    }

    /// `status` column values a record may hold when moving to this status
    pub fn predecessors(&self) -> &'static [&'static str] {
        match self {
            UploadStatus::Pending => &[],
            UploadStatus::Stored => &["pending"],
            UploadStatus::Persisted => &["stored"],
            UploadStatus::Notified => &["persisted"],
            UploadStatus::Failed(_) => &["pending", "stored", "persisted"],
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStatus::Failed(stage) => write!(f, "failed({})", stage.as_str()),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Metadata for one upload attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    /// Assigned by the metadata store on insert
    pub id: Uuid,
    /// Hex SHA-256 of the file contents
    pub fingerprint: String,
    /// Caller-supplied file name, display only
    pub original_name: String,
    /// Object key, set once the object is stored
    pub storage_key: Option<String>,
    /// Public URL, set together with the storage key
    pub url: Option<String>,
    /// File size in bytes
    pub size_bytes: i64,
    pub status: UploadStatus,
    /// When the fingerprint was claimed
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    /// Apply a transition in place; illegal moves leave the record untouched
    pub fn apply(&mut self, update: &RecordUpdate) -> bool {
        if !self.status.can_transition_to(update.status) {
            return false;
        }

        self.status = update.status;
        if self.storage_key.is_none() {
            self.storage_key = update.storage_key.clone();
        }
        if self.url.is_none() {
            self.url = update.url.clone();
        }
        self.updated_at = Utc::now();

        true
    }
}

/// Claim for a fingerprint that has no active record yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewUpload {
    pub fingerprint: String,
    pub original_name: String,
    pub size_bytes: i64,
}

/// Fields written on a status transition
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub status: UploadStatus,
    /// Only applied while the stored key is still unset
    pub storage_key: Option<String>,
    /// Only applied while the stored URL is still unset
    pub url: Option<String>,
}

impl RecordUpdate {
    pub fn status(status: UploadStatus) -> Self {
        Self {
            status,
            storage_key: None,
            url: None,
        }
    }

    pub fn stored(storage_key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            status: UploadStatus::Stored,
            storage_key: Some(storage_key.into()),
            url: Some(url.into()),
        }
    }
}

/// Result of an atomic claim on a fingerprint
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The claim was won; the record is `Pending`
    Created(UploadRecord),
    /// Another non-failed record already holds the fingerprint
    Existing(UploadRecord),
}

/// Content fingerprint: lowercase hex SHA-256
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Whether a string has the shape of a fingerprint
pub fn is_fingerprint(value: &str) -> bool {
    value.len() == 64
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Reduce an untrusted file name to something safe inside an object key
///
/// Only the last path component survives (both `/` and `\` count as
/// separators), control characters are dropped, anything outside
/// `[A-Za-z0-9._-]` becomes `_` and leading dots are stripped.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or_default();

    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();

    let trimmed: String = cleaned
        .trim_start_matches('.')
        .chars()
        .take(MAX_FILE_NAME_CHARS)
        .collect();

    if trimmed.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        trimmed
    }
}

/// Object key for an upload: `<millis>-<random>_<sanitized name>`
pub fn storage_key(original_name: &str, now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();

    format!(
        "{millis}-{random}_{name}",
        millis = now.timestamp_millis(),
        random = &random[..8],
        name = sanitize_file_name(original_name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(is_fingerprint(&fingerprint(b"hello")));
    }

    #[test]
    fn test_is_fingerprint_rejects_other_shapes() {
        assert!(!is_fingerprint("abc"));
        assert!(!is_fingerprint(&"G".repeat(64)));
        assert!(!is_fingerprint(&"A".repeat(64)));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("photo.png"), "photo.png");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("my holiday pic.jpg"), "my_holiday_pic.jpg");
        assert_eq!(sanitize_file_name("bad\u{0}name\n.txt"), "badname.txt");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name("r\u{e9}sum\u{e9}.doc"), "r_sum_.doc");
    }

    #[test]
    fn test_sanitize_falls_back_when_empty() {
        assert_eq!(sanitize_file_name(""), "upload");
        assert_eq!(sanitize_file_name(".."), "upload");
        assert_eq!(sanitize_file_name("dir/"), "upload");
        assert_eq!(sanitize_file_name("\u{7}\u{8}"), "upload");
    }

    #[test]
    fn test_sanitize_caps_length() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_file_name(&long).len(), 128);
    }

    #[test]
    fn test_storage_key_format() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        let key = storage_key("../secret/cat photo.png", now);

        let (prefix, name) = key.split_once('_').unwrap();
        let (millis, random) = prefix.split_once('-').unwrap();

        assert_eq!(millis, now.timestamp_millis().to_string());
        assert_eq!(random.len(), 8);
        assert_eq!(name, "cat_photo.png");
        assert!(!key.contains('/'));
    }

    #[test]
    fn test_storage_keys_do_not_collide() {
        let now = Utc::now();
        assert_ne!(storage_key("a.txt", now), storage_key("a.txt", now));
    }

    #[test]
    fn test_success_path_transitions() {
        assert!(UploadStatus::Pending.can_transition_to(UploadStatus::Stored));
        assert!(UploadStatus::Stored.can_transition_to(UploadStatus::Persisted));
        assert!(UploadStatus::Persisted.can_transition_to(UploadStatus::Notified));
    }

    #[test]
    fn test_transitions_cannot_skip_or_go_back() {
        assert!(!UploadStatus::Pending.can_transition_to(UploadStatus::Persisted));
        assert!(!UploadStatus::Pending.can_transition_to(UploadStatus::Notified));
        assert!(!UploadStatus::Persisted.can_transition_to(UploadStatus::Stored));
        assert!(!UploadStatus::Notified.can_transition_to(UploadStatus::Pending));
    }

    #[test]
    fn test_terminal_statuses_are_final() {
        let failed = UploadStatus::Failed(FailedStage::Store);

        assert!(UploadStatus::Stored.can_transition_to(UploadStatus::Failed(FailedStage::Persist)));
        assert!(!UploadStatus::Notified.can_transition_to(failed));
        assert!(!failed.can_transition_to(UploadStatus::Failed(FailedStage::Notify)));
        assert!(!failed.can_transition_to(UploadStatus::Stored));
    }

    #[test]
    fn test_predecessors_match_transition_rules() {
        let all = [
            UploadStatus::Pending,
            UploadStatus::Stored,
            UploadStatus::Persisted,
            UploadStatus::Notified,
            UploadStatus::Failed(FailedStage::Store),
            UploadStatus::Failed(FailedStage::Persist),
            UploadStatus::Failed(FailedStage::Notify),
        ];

        for next in all {
            for current in all {
                assert_eq!(
                    next.predecessors().contains(&current.as_str()),
                    current.can_transition_to(next),
                    "{current} -> {next}"
                );
            }
        }
    }

    fn pending_record() -> UploadRecord {
        UploadRecord {
            id: Uuid::new_v4(),
            fingerprint: fingerprint(b"bytes"),
            original_name: "cat.png".to_string(),
            storage_key: None,
            url: None,
            size_bytes: 5,
            status: UploadStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_apply_sets_key_and_url_once() {
        let mut record = pending_record();

        assert!(record.apply(&RecordUpdate::stored("k1_cat.png", "https://cdn/k1_cat.png")));
        assert!(record.apply(&RecordUpdate {
            status: UploadStatus::Persisted,
            storage_key: Some("k2_cat.png".to_string()),
            url: Some("https://cdn/k2_cat.png".to_string()),
        }));

        assert_eq!(record.status, UploadStatus::Persisted);
        assert_eq!(record.storage_key.as_deref(), Some("k1_cat.png"));
        assert_eq!(record.url.as_deref(), Some("https://cdn/k1_cat.png"));
    }

    #[test]
    fn test_apply_rejects_illegal_transition() {
        let mut record = pending_record();

        assert!(!record.apply(&RecordUpdate::status(UploadStatus::Notified)));
        assert_eq!(record.status, UploadStatus::Pending);
    }

    #[test]
    fn test_status_columns() {
        let failed = UploadStatus::Failed(FailedStage::Notify);

        assert_eq!(failed.as_str(), "failed");
        assert_eq!(failed.failed_stage(), Some(FailedStage::Notify));
        assert_eq!(UploadStatus::from_columns("failed", Some("notify")), Some(failed));
        assert_eq!(UploadStatus::from_columns("failed", None), None);
        assert_eq!(
            UploadStatus::from_columns("persisted", None),
            Some(UploadStatus::Persisted)
        );
        assert_eq!(UploadStatus::from_columns("archived", None), None);
        assert_eq!(failed.to_string(), "failed(notify)");
    }
}
