use crate::config::S3Config;
use crate::error::StorageError;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

/// Blob storage for uploaded files
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` under `key` and return the object's public URL
    async fn put(&self, key: &str, bytes: Bytes) -> Result<String, StorageError>;

    /// Remove the object under `key`
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            public_base_url = %config.public_base_url,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    fn acl(&self) -> Option<ObjectCannedAcl> {
        self.config.object_acl.as_deref().map(ObjectCannedAcl::from)
    }

    /// Simple single-part upload for small files
    async fn simple_upload(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .set_acl(self.acl())
            .send()
            .await
            .map_err(|e| StorageError::Request(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .set_acl(self.acl())
            .send()
            .await
            .map_err(|e| StorageError::Request(DisplayErrorContext(&e).to_string()))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StorageError::Request("No upload ID in response".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, &bytes).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| StorageError::Request(DisplayErrorContext(&e).to_string()))?;

                Ok(())
            }
            Err(e) => {
                // Abort so S3 does not keep billing for the orphaned parts
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        bytes: &Bytes,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let part_size = self.config.part_size_bytes;
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut offset = 0;

        while offset < bytes.len() {
            let end = (offset + part_size).min(bytes.len());

            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(bytes.slice(offset..end)))
                .send()
                .await
                .map_err(|e| StorageError::Request(DisplayErrorContext(&e).to_string()))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );

            part_number += 1;
            offset = end;
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn put(&self, key: &str, bytes: Bytes) -> Result<String, StorageError> {
        let content_type = content_type_for_key(key);
        let size_bytes = bytes.len();

        debug!(key = %key, content_type = %content_type, "Uploading object to S3");

        if size_bytes > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, bytes, content_type).await?;
        } else {
            self.simple_upload(key, bytes, content_type).await?;
        }

        info!(key = %key, size_bytes = size_bytes, "Object uploaded successfully");

        Ok(public_url(&self.config.public_base_url, key))
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Request(DisplayErrorContext(&e).to_string()))?;

        debug!(key = %key, "Object deleted from S3");
        Ok(())
    }
}

/// Public URL of an object under the configured base URL
pub fn public_url(base_url: &str, key: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), key)
}

/// Content type from the key's file extension
fn content_type_for_key(key: &str) -> &'static str {
    let extension = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "zip" => "application/zip",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_url() {
        assert_eq!(
            public_url("https://cdn.example.com", "1700000000000-ab12cd34_cat.png"),
            "https://cdn.example.com/1700000000000-ab12cd34_cat.png"
        );
        assert_eq!(
            public_url("https://cdn.example.com/", "k_a.txt"),
            "https://cdn.example.com/k_a.txt"
        );
    }

    #[test]
    fn test_content_type_for_key() {
        assert_eq!(content_type_for_key("1-abc_photo.jpg"), "image/jpeg");
        assert_eq!(content_type_for_key("1-abc_PHOTO.JPEG"), "image/jpeg");
        assert_eq!(content_type_for_key("1-abc_doc.pdf"), "application/pdf");
        assert_eq!(content_type_for_key("1-abc_upload"), "application/octet-stream");
        assert_eq!(content_type_for_key("1-abc_archive.tar.gz"), "application/octet-stream");
    }
}
