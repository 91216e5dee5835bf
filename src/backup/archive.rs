// lbackup/src/backup/archive.rs
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::backup::job::{Artifact, ArtifactProducer};
use crate::backup::staging::StagingArea;
use crate::errors::{BackupError, Result};

/// Packs every regular file under a fixed set of directory roots into one zip file.
pub struct StorageArchiveProducer {
    sources: Vec<PathBuf>,
    base: PathBuf,
    /// Raised whenever a `produce` call ends, including when its future is dropped.
    cancelled: Arc<AtomicBool>,
}

impl StorageArchiveProducer {
    /// Entry names are relative to `base`, e.g. `app/public/avatars/1.png` for a base of
    /// `storage`.
    pub fn new(sources: Vec<PathBuf>, base: impl Into<PathBuf>) -> Self {
        StorageArchiveProducer {
            sources,
            base: base.into(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Sets the flag on drop so the blocking archive task stops instead of outliving its job.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl ArtifactProducer for StorageArchiveProducer {
    async fn produce(&self, staging: &StagingArea) -> Result<Artifact> {
        let dest = staging.path().to_path_buf();
        let sources = self.sources.clone();
        let base = self.base.clone();

        self.cancelled.store(false, Ordering::Relaxed);
        let _cancel_on_drop = CancelOnDrop(self.cancelled.clone());
        let cancelled = self.cancelled.clone();

        // Compression is unbounded in duration; keep it off the async workers.
        let task_dest = dest.clone();
        let summary = tokio::task::spawn_blocking(move || {
            create_zip_archive(&sources, &base, &task_dest, &cancelled)
        })
        .await
        .map_err(|e| BackupError::ArchiveCreateFailed {
            path: dest.clone(),
            reason: format!("archive task aborted: {}", e),
        })??;

        let size_bytes = fs::metadata(&dest)
            .map_err(|e| BackupError::staging(&dest, e))?
            .len();
        info!(
            path = %dest.display(),
            files = summary.files,
            skipped = summary.skipped,
            size_bytes,
            "✓ Storage archive created"
        );

        Ok(Artifact {
            logical_name: dest
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            local_path: dest,
            size_bytes,
            source_folders: self.sources.clone(),
        })
    }
}

/// Reader that fails once `cancelled` is raised, so a large file stops mid-copy.
struct CancellableReader<'a, R> {
    inner: R,
    cancelled: &'a AtomicBool,
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(io::Error::other("archive cancelled"));
        }
        self.inner.read(buf)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub files: usize,
    pub skipped: usize,
}

/// Writes `archive_dest_path` as a zip of all regular files below `sources`.
///
/// A file already at the destination is replaced. Missing roots and unreadable entries are
/// logged and skipped; only failing to create or finalise the zip itself is an error.
///
/// Once `cancelled` is raised the run stops at the next read and fails.
pub fn create_zip_archive(
    sources: &[PathBuf],
    base: &Path,
    archive_dest_path: &Path,
    cancelled: &AtomicBool,
) -> Result<ArchiveSummary> {
    let create_failed = |reason: String| BackupError::ArchiveCreateFailed {
        path: archive_dest_path.to_path_buf(),
        reason,
    };

    if archive_dest_path.exists() {
        fs::remove_file(archive_dest_path)
            .map_err(|e| create_failed(format!("cannot remove previous archive: {}", e)))?;
        info!(path = %archive_dest_path.display(), "Existing archive removed");
    }

    let archive_file = File::create(archive_dest_path).map_err(|e| create_failed(e.to_string()))?;
    let mut zip = ZipWriter::new(archive_file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut summary = ArchiveSummary::default();

    for source in sources {
        if !source.is_dir() {
            warn!(dir = %source.display(), "Source directory does not exist, skipping");
            continue;
        }

        for entry in WalkDir::new(source).follow_links(true) {
            if cancelled.load(Ordering::Relaxed) {
                return Err(create_failed("cancelled before completion".to_string()));
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %source.display(), error = %e, "Failed to read directory entry, skipping");
                    summary.skipped += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let mut input = match File::open(path) {
                Ok(file) => CancellableReader { inner: file, cancelled },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot open file, skipping");
                    summary.skipped += 1;
                    continue;
                }
            };
            let size = input.inner.metadata().map(|m| m.len()).unwrap_or(0);
            let name = entry_name(path, base, source);

            zip.start_file(name.as_str(), options.large_file(size >= u32::MAX as u64))
                .map_err(|e| create_failed(format!("cannot add {}: {}", name, e)))?;
            io::copy(&mut input, &mut zip)
                .map_err(|e| create_failed(format!("cannot write {}: {}", name, e)))?;
            summary.files += 1;
        }
    }

    zip.finish().map_err(|e| create_failed(format!("cannot finalise archive: {}", e)))?;
    Ok(summary)
}

/// Archive entry name for `path`, using `/` separators regardless of platform.
fn entry_name(path: &Path, base: &Path, source: &Path) -> String {
    let relative = path
        .strip_prefix(base)
        .or_else(|_| path.strip_prefix(source.parent().unwrap_or(source)))
        .unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
