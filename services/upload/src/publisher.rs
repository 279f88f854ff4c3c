//! Upload notification publishing.
//!
//! Notifications go to Kafka as JSON, keyed by fingerprint so every event
//! for the same content lands on the same partition.

use crate::config::KafkaConfig;
use crate::error::NotifyError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Value of the `message-type` header on upload events
pub const UPLOAD_EVENT_TYPE: &str = "upload.created";

/// Notification sent once an upload is stored and recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadEvent {
    pub record_id: Uuid,
    pub fingerprint: String,
    pub url: String,
    pub original_name: String,
    pub size_bytes: i64,
    pub uploaded_at: DateTime<Utc>,
    /// Human-readable summary for plain subscribers (email, chat)
    pub message: String,
}

impl UploadEvent {
    pub fn new(
        record_id: Uuid,
        fingerprint: impl Into<String>,
        url: impl Into<String>,
        original_name: impl Into<String>,
        size_bytes: i64,
    ) -> Self {
        let url = url.into();
        Self {
            record_id,
            fingerprint: fingerprint.into(),
            message: format!("New file uploaded: {url}"),
            url,
            original_name: original_name.into(),
            size_bytes,
            uploaded_at: Utc::now(),
        }
    }
}

/// Broker acknowledgement for a published event
#[derive(Debug, Clone, PartialEq)]
pub struct PublishAck {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Sink for upload notifications
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, event: &UploadEvent) -> Result<PublishAck, NotifyError>;
}

/// Kafka-backed event publisher
pub struct KafkaEventPublisher {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl KafkaEventPublisher {
    /// Create a new producer with the given configuration
    pub fn new(config: &KafkaConfig) -> Result<Self, NotifyError> {
        info!(
            bootstrap_servers = %config.bootstrap_servers,
            topic = %config.notification_topic,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = build_producer_config(config)
            .create()
            .map_err(|e| NotifyError::Send {
                topic: config.notification_topic.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            producer,
            delivery_timeout: config.message_timeout(),
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    #[instrument(skip(self, event), fields(fingerprint = %event.fingerprint))]
    async fn publish(&self, topic: &str, event: &UploadEvent) -> Result<PublishAck, NotifyError> {
        let payload = serde_json::to_vec(event)?;
        let headers = OwnedHeaders::new().insert(Header {
            key: "message-type",
            value: Some(UPLOAD_EVENT_TYPE),
        });

        let record = FutureRecord::to(topic)
            .key(&event.fingerprint)
            .payload(&payload)
            .headers(headers);

        debug!(
            "Sending upload event to topic {} (size: {} bytes)",
            topic,
            payload.len()
        );

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
            .map_err(|(e, _)| NotifyError::Send {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        debug!(
            "Upload event delivered to partition {} at offset {}",
            partition, offset
        );

        Ok(PublishAck {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }
}

/// Build the rdkafka producer configuration
pub fn build_producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("client.id", &config.client_id)
        .set("acks", &config.acks)
        .set("enable.idempotence", "true")
        .set("message.timeout.ms", config.message_timeout_ms.to_string());

    // Configure SSL if enabled
    if config.ssl_enabled {
        client_config.set("security.protocol", "SASL_SSL");
        if let Some(ref ca_location) = config.ssl_ca_location {
            client_config.set("ssl.ca.location", ca_location);
        }
    }

    // Configure SASL if credentials provided
    if let (Some(ref username), Some(ref password)) =
        (&config.sasl_username, &config.sasl_password)
    {
        client_config
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    client_config
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kafka_config() -> KafkaConfig {
        KafkaConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "upload-service".to_string(),
            notification_topic: "filerelay.uploads".to_string(),
            acks: "all".to_string(),
            message_timeout_ms: 5000,
            ssl_enabled: false,
            ssl_ca_location: None,
            sasl_username: None,
            sasl_password: None,
        }
    }

    #[test]
    fn test_producer_config_build() {
        let client_config = build_producer_config(&kafka_config());

        assert_eq!(client_config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(client_config.get("acks"), Some("all"));
        assert_eq!(client_config.get("message.timeout.ms"), Some("5000"));
        assert_eq!(client_config.get("security.protocol"), None);
    }

    #[test]
    fn test_producer_config_with_sasl() {
        let mut config = kafka_config();
        config.ssl_enabled = true;
        config.sasl_username = Some("relay".to_string());
        config.sasl_password = Some("hunter2".to_string());

        let client_config = build_producer_config(&config);

        assert_eq!(client_config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client_config.get("sasl.username"), Some("relay"));
    }

    #[test]
    fn test_upload_event_json() {
        let event = UploadEvent::new(
            Uuid::nil(),
            "ab".repeat(32),
            "https://cdn.example.com/1-ab12cd34_cat.png",
            "cat.png",
            42,
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["original_name"], "cat.png");
        assert_eq!(json["size_bytes"], 42);
        assert_eq!(
            json["message"],
            "New file uploaded: https://cdn.example.com/1-ab12cd34_cat.png"
        );
    }
}
