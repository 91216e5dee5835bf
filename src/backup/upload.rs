// lbackup/src/backup/upload.rs
use futures::stream::{self, StreamExt, TryStreamExt};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::pin;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

use crate::backup::job::Artifact;
use crate::backup::s3_upload::{ObjectStore, UploadedPart};
use crate::config::Driver;
use crate::errors::{BackupError, Result};

/// Artifacts above this size go through the multipart path. Exactly this size does not.
pub const MULTIPART_THRESHOLD: u64 = 500 * 1024 * 1024;
pub const PART_SIZE: u64 = 8 * 1024 * 1024;
/// Parts in flight at once during a multipart upload.
const PART_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    LocalCopy,
    SimpleRemotePut,
    MultipartRemoteUpload,
}

impl UploadStrategy {
    /// Pure choice on driver and size. `allow_multipart` is false for jobs whose artifacts
    /// always go up in one request.
    pub fn select(driver: &Driver, size_bytes: u64, allow_multipart: bool) -> Self {
        match driver {
            Driver::Local => UploadStrategy::LocalCopy,
            Driver::Remote(_) if allow_multipart && size_bytes > MULTIPART_THRESHOLD => {
                UploadStrategy::MultipartRemoteUpload
            }
            Driver::Remote(_) => UploadStrategy::SimpleRemotePut,
        }
    }

    pub fn is_remote(self) -> bool {
        !matches!(self, UploadStrategy::LocalCopy)
    }

    /// Delivers `artifact` to `target`. Remote variants remove the local file once the store
    /// has confirmed the upload; on failure the local file is left in place.
    pub async fn execute(
        self,
        artifact: &Artifact,
        target: &UploadTarget,
        store: Option<&dyn ObjectStore>,
        progress: Option<&ProgressSender>,
    ) -> Result<()> {
        info!(
            strategy = ?self,
            driver = %target.driver_name,
            path = %target.remote_path,
            size_bytes = artifact.size_bytes,
            "Delivering artifact"
        );
        if self == UploadStrategy::LocalCopy {
            return local_copy(artifact, Path::new(&target.remote_path)).await;
        }

        let store = store.ok_or_else(|| {
            BackupError::Config(format!("driver '{}' has no remote store configured", target.driver_name))
        })?;
        match self {
            UploadStrategy::SimpleRemotePut => store.put_file(&target.remote_path, &artifact.local_path).await?,
            _ => {
                multipart_upload(store, artifact, &target.remote_path, PART_SIZE, progress).await?;
            }
        }
        info!(key = %target.remote_path, "✅ Artifact uploaded");
        remove_local_copy(&artifact.local_path).await;
        Ok(())
    }
}

/// Where one artifact goes: an object key for remote drivers, a file path for `local`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub driver_name: String,
    pub remote_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub completed: u64,
    pub total: u64,
}

pub type ProgressSender = UnboundedSender<UploadProgress>;

pub fn total_parts(size_bytes: u64, part_size: u64) -> u64 {
    size_bytes.div_ceil(part_size)
}

async fn local_copy(artifact: &Artifact, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            BackupError::Upload(format!("cannot create local backup directory {}: {}", parent.display(), e))
        })?;
    }
    let written = tokio::fs::copy(&artifact.local_path, dest).await.map_err(|e| {
        BackupError::Upload(format!("cannot write local backup {}: {}", dest.display(), e))
    })?;
    if written != artifact.size_bytes {
        return Err(BackupError::Upload(format!(
            "local backup {} is {} bytes, expected {}",
            dest.display(),
            written,
            artifact.size_bytes
        )));
    }
    info!(path = %dest.display(), "✅ Backup stored on local disk");
    Ok(())
}

async fn remove_local_copy(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(path = %path.display(), "Local artifact removed after upload"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove local artifact after upload"),
    }
}

/// Uploads `artifact` in `part_size` chunks and returns the number of parts sent.
///
/// Progress events carry a strictly increasing `completed` count that ends at
/// `total_parts(size, part_size)`. Any failure aborts the multipart upload on the store.
pub async fn multipart_upload(
    store: &dyn ObjectStore,
    artifact: &Artifact,
    key: &str,
    part_size: u64,
    progress: Option<&ProgressSender>,
) -> Result<u64> {
    let total = total_parts(artifact.size_bytes, part_size);
    let upload_id = store.create_multipart(key).await?;
    info!(key = %key, upload_id = %upload_id, total_parts = total, part_size, "Multipart upload started");

    let result = match upload_parts(store, artifact, key, &upload_id, part_size, total, progress).await {
        Ok(parts) => store.complete_multipart(key, &upload_id, parts).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!(key = %key, error = %e, "Multipart upload failed");
        if let Err(abort_err) = store.abort_multipart(key, &upload_id).await {
            warn!(key = %key, error = %abort_err, "Failed to abort multipart upload");
        }
        return Err(e);
    }
    Ok(total)
}

async fn upload_parts(
    store: &dyn ObjectStore,
    artifact: &Artifact,
    key: &str,
    upload_id: &str,
    part_size: u64,
    total: u64,
    progress: Option<&ProgressSender>,
) -> Result<Vec<UploadedPart>> {
    let path = artifact.local_path.clone();
    let size = artifact.size_bytes;

    // Reads happen in order; uploads overlap up to PART_CONCURRENCY.
    let mut uploads = pin!(stream::iter(1..=total)
        .then(move |n| {
            let path = path.clone();
            async move { read_part(path, n, part_size, size).await }
        })
        .map_ok(move |(part_number, body)| async move {
            let e_tag = store.upload_part(key, upload_id, part_number, body).await?;
            Ok::<_, BackupError>(UploadedPart { part_number, e_tag })
        })
        .try_buffer_unordered(PART_CONCURRENCY));

    let mut parts = Vec::with_capacity(total as usize);
    while let Some(part) = uploads.try_next().await? {
        parts.push(part);
        if let Some(tx) = progress {
            // The observer is optional; a closed channel does not affect the upload.
            let _ = tx.send(UploadProgress {
                completed: parts.len() as u64,
                total,
            });
        }
    }

    if parts.len() as u64 != total {
        return Err(BackupError::Upload(format!(
            "uploaded {} of {} parts for {}",
            parts.len(),
            total,
            key
        )));
    }
    parts.sort_by_key(|p| p.part_number);
    Ok(parts)
}

async fn read_part(path: PathBuf, part_number: u64, part_size: u64, size: u64) -> Result<(i32, Vec<u8>)> {
    let offset = (part_number - 1) * part_size;
    let len = part_size.min(size.saturating_sub(offset)) as usize;
    let read_err = |e: std::io::Error| BackupError::staging(&path, e);

    let mut file = tokio::fs::File::open(&path).await.map_err(read_err)?;
    file.seek(SeekFrom::Start(offset)).await.map_err(read_err)?;
    let mut body = vec![0u8; len];
    file.read_exact(&mut body).await.map_err(read_err)?;

    let part_number = i32::try_from(part_number)
        .map_err(|_| BackupError::Upload(format!("part number {} out of range", part_number)))?;
    Ok((part_number, body))
}
