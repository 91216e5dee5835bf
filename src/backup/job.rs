// lbackup/src/backup/job.rs
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::path::PathBuf;

use crate::backup::staging::StagingArea;
use crate::config::Driver;
use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    DatabaseDump,
    StorageArchive,
}

/// One invocation of a backup command. Nothing about it outlives the run.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub kind: BackupKind,
    pub created_at: NaiveDateTime,
    pub driver: Driver,
}

/// A produced backup file waiting in staging.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub local_path: PathBuf,
    pub logical_name: String,
    pub size_bytes: u64,
    /// Directory roots packed into the file; empty for dumps.
    pub source_folders: Vec<PathBuf>,
}

/// Produces the artifact for a job directly into the path reserved by `staging`.
#[async_trait]
pub trait ArtifactProducer: Send + Sync {
    async fn produce(&self, staging: &StagingArea) -> Result<Artifact>;
}
