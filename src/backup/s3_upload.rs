// lbackup/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::RemoteConfig;
use crate::errors::{BackupError, Result};

/// Part of a multipart upload that the store has acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub e_tag: String,
}

/// The S3-API operations the backup pipeline needs from a remote bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_file(&self, key: &str, file_path: &Path) -> Result<()>;
    async fn create_multipart(&self, key: &str) -> Result<String>;
    async fn upload_part(&self, key: &str, upload_id: &str, part_number: i32, body: Vec<u8>) -> Result<String>;
    async fn complete_multipart(&self, key: &str, upload_id: &str, parts: Vec<UploadedPart>) -> Result<()>;
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;
    /// Keys directly inside `prefix/`. Objects in nested folders are not returned.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// `backups` and `/backups/` both list `backups/...`; an empty prefix lists the whole bucket.
pub fn folder_prefix(prefix: &str) -> String {
    match prefix.trim_matches('/') {
        "" => String::new(),
        folder => format!("{}/", folder),
    }
}

/// Builds a fresh [`ObjectStore`] for one upload attempt.
#[async_trait]
pub trait ObjectStoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ObjectStore>>;
}

#[async_trait]
impl ObjectStoreConnector for RemoteConfig {
    async fn connect(&self) -> Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::connect(self).await);
        Ok(store)
    }
}

/// An S3-compatible bucket (Backblaze B2, DigitalOcean Spaces, MinIO, AWS).
pub struct S3ObjectStore {
    client: s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(remote: &RemoteConfig) -> Self {
        debug!(endpoint = %remote.endpoint_url, bucket = %remote.bucket_name, "Building S3 client");
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&remote.endpoint_url)
            .region(Region::new(remote.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &remote.access_key_id,
                &remote.secret_access_key,
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        S3ObjectStore {
            client: s3::Client::from_conf(s3_config),
            bucket: remote.bucket_name.clone(),
        }
    }

    fn remote_err(&self, action: &str, key: &str, err: impl std::fmt::Display) -> BackupError {
        BackupError::Remote(format!(
            "{} failed for s3://{}/{}: {}",
            action, self.bucket, key, err
        ))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_file(&self, key: &str, file_path: &Path) -> Result<()> {
        let body = ByteStream::from_path(file_path)
            .await
            .map_err(|e| BackupError::Upload(format!("cannot stream {}: {}", file_path.display(), e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| self.remote_err("PutObject", key, s3::error::DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> Result<String> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.remote_err("CreateMultipartUpload", key, s3::error::DisplayErrorContext(e)))?;
        created
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| self.remote_err("CreateMultipartUpload", key, "no upload id returned"))
    }

    async fn upload_part(&self, key: &str, upload_id: &str, part_number: i32, body: Vec<u8>) -> Result<String> {
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| self.remote_err("UploadPart", key, s3::error::DisplayErrorContext(e)))?;
        uploaded
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| self.remote_err("UploadPart", key, format!("no ETag for part {}", part_number)))
    }

    async fn complete_multipart(&self, key: &str, upload_id: &str, parts: Vec<UploadedPart>) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(p.part_number)
                            .e_tag(p.e_tag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| self.remote_err("CompleteMultipartUpload", key, s3::error::DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| self.remote_err("AbortMultipartUpload", key, s3::error::DisplayErrorContext(e)))?;
        info!(key = %key, upload_id = %upload_id, "Multipart upload aborted");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let folder = folder_prefix(prefix);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&folder)
                .delimiter("/")
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| self.remote_err("ListObjectsV2", &folder, s3::error::DisplayErrorContext(e)))?;

            keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => continuation = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.remote_err("DeleteObject", key, s3::error::DisplayErrorContext(e)))?;
        Ok(())
    }
}
