use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Smallest part S3 accepts for any multipart part but the last
pub const MIN_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Main configuration for the upload service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Upload pipeline configuration
    #[serde(default)]
    pub upload: UploadConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for uploaded files
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Public base URL objects are served from (CDN or bucket website)
    pub public_base_url: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Canned ACL applied to new objects, e.g. "public-read"
    pub object_acl: Option<String>,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Kafka producer configuration for upload notifications
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Client ID reported to the brokers
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Topic upload notifications are published to
    #[serde(default = "default_notification_topic")]
    pub notification_topic: String,
    /// Required acknowledgements ("all", "1", "0")
    #[serde(default = "default_acks")]
    pub acks: String,
    /// Producer delivery timeout in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
}

/// Upload pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Largest accepted file in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Timeout applied to every object store, database and publish call
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Multipart field carrying the file
    #[serde(default = "default_form_field")]
    pub form_field: String,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Configuration validation errors
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// Default value functions
fn default_service_name() -> String {
    "upload-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_client_id() -> String {
    "upload-service".to_string()
}

fn default_notification_topic() -> String {
    "filerelay.uploads".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_message_timeout_ms() -> u64 {
    10000
}

fn default_max_upload_bytes() -> usize {
    25 * 1024 * 1024 // 25MB
}

fn default_stage_timeout_secs() -> u64 {
    30
}

fn default_form_field() -> String {
    "file".to_string()
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "upload-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/upload").required(false))
            .add_source(config::File::with_name("/etc/filerelay/upload").required(false))
            // Override with environment variables
            // UPLOAD__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("UPLOAD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "upload.max_upload_bytes must be greater than zero".to_string(),
            ));
        }

        if self.upload.stage_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "upload.stage_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.upload.form_field.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "upload.form_field cannot be empty".to_string(),
            ));
        }

        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigError::Invalid("s3.bucket cannot be empty".to_string()));
        }

        if !(self.s3.public_base_url.starts_with("http://")
            || self.s3.public_base_url.starts_with("https://"))
        {
            return Err(ConfigError::Invalid(
                "s3.public_base_url must be an http(s) URL".to_string(),
            ));
        }

        if self.s3.part_size_bytes < MIN_PART_SIZE_BYTES {
            return Err(ConfigError::Invalid(format!(
                "s3.part_size_bytes must be at least {MIN_PART_SIZE_BYTES} bytes"
            )));
        }

        if self.kafka.notification_topic.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "kafka.notification_topic cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Per-stage timeout as Duration
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.upload.stage_timeout_secs)
    }
}

impl DatabaseConfig {
    /// Pool acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Idle connection timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl KafkaConfig {
    /// Producer delivery timeout as Duration
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
            stage_timeout_secs: default_stage_timeout_secs(),
            form_field: default_form_field(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        let json = serde_json::json!({
            "s3": {
                "bucket": "uploads",
                "public_base_url": "https://cdn.example.com"
            },
            "database": { "url": "postgres://localhost/uploads" },
            "kafka": { "bootstrap_servers": "localhost:9092" }
        });

        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = minimal_config();

        assert_eq!(config.upload.max_upload_bytes, 25 * 1024 * 1024);
        assert_eq!(config.upload.form_field, "file");
        assert_eq!(config.stage_timeout(), Duration::from_secs(30));
        assert_eq!(config.kafka.notification_topic, "filerelay.uploads");
        assert_eq!(config.s3.region, "us-east-1");
        assert!(config.s3.object_acl.is_none());
        assert!(config.database.run_migrations);
        assert_eq!(config.api.port, 8080);
    }

    #[test]
    fn test_minimal_config_is_valid() {
        assert_eq!(minimal_config().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_zero_upload_limit() {
        let mut config = minimal_config();
        config.upload.max_upload_bytes = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_stage_timeout() {
        let mut config = minimal_config();
        config.upload.stage_timeout_secs = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_http_public_base_url() {
        let mut config = minimal_config();
        config.s3.public_base_url = "s3://uploads".to_string();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("public_base_url"));
    }

    #[test]
    fn test_rejects_part_size_below_s3_minimum() {
        let mut config = minimal_config();
        config.s3.part_size_bytes = 1024 * 1024;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("part_size_bytes"));

        config.s3.part_size_bytes = MIN_PART_SIZE_BYTES;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_database_timeouts() {
        let config = minimal_config();

        assert_eq!(config.database.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.database.idle_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_rejects_empty_topic() {
        let mut config = minimal_config();
        config.kafka.notification_topic = "  ".to_string();

        assert!(config.validate().is_err());
    }
}
