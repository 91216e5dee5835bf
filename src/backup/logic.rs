// lbackup/src/backup/logic.rs
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::backup::job::{ArtifactProducer, BackupJob, BackupKind};
use crate::backup::naming::{RetentionSet, remote_key};
use crate::backup::retention::{self, RetentionReport};
use crate::backup::s3_upload::{ObjectStore, ObjectStoreConnector};
use crate::backup::staging::StagingArea;
use crate::backup::upload::{ProgressSender, UploadStrategy, UploadTarget};
use crate::errors::{BackupError, Result};

/// Everything a pipeline run needs besides the job and its producer.
pub struct PipelineSettings<'a> {
    pub staging_dir: PathBuf,
    /// Directory receiving the artifact for the `local` driver.
    pub local_dir: PathBuf,
    /// Object key prefix for remote drivers; also the folder retention sweeps.
    pub remote_prefix: String,
    pub connector: Option<&'a dyn ObjectStoreConnector>,
    pub progress: Option<ProgressSender>,
}

#[derive(Debug)]
pub struct JobReport {
    pub kind: BackupKind,
    pub artifact_name: String,
    pub size_bytes: u64,
    pub strategy: UploadStrategy,
    pub destination: String,
    pub retention: Option<RetentionReport>,
}

/// Produce → stage → deliver → (retention for remote storage archives) → release.
///
/// The staging area is released on every path out of this function: explicitly after a
/// successful run, and by its `Drop` when a stage fails or the future is dropped.
pub async fn perform_backup_orchestration(
    job: &BackupJob,
    producer: &dyn ArtifactProducer,
    file_name: &str,
    settings: &PipelineSettings<'_>,
) -> Result<JobReport> {
    info!(kind = ?job.kind, driver = %job.driver, created_at = %job.created_at, "🚀 Starting backup job");

    let mut staging = StagingArea::acquire(&settings.staging_dir, file_name)?;
    let artifact = producer.produce(&staging).await?;
    info!(
        artifact = %artifact.logical_name,
        size_bytes = artifact.size_bytes,
        source_folders = ?artifact.source_folders,
        "Artifact staged"
    );

    // Dumps are small enough to always go up in one request.
    let allow_multipart = job.kind == BackupKind::StorageArchive;
    let strategy = UploadStrategy::select(&job.driver, artifact.size_bytes, allow_multipart);

    let target = UploadTarget {
        driver_name: job.driver.name().to_string(),
        remote_path: if strategy.is_remote() {
            remote_key(&settings.remote_prefix, &artifact.logical_name)
        } else {
            settings
                .local_dir
                .join(&artifact.logical_name)
                .to_string_lossy()
                .into_owned()
        },
    };

    let store = if strategy.is_remote() {
        Some(connect(settings).await?)
    } else {
        None
    };

    if let Err(e) = strategy
        .execute(&artifact, &target, store.as_deref(), settings.progress.as_ref())
        .await
    {
        error!(error = %e, path = %target.remote_path, "Delivery failed");
        return Err(e);
    }

    let retention = match (&store, job.kind) {
        (Some(store), BackupKind::StorageArchive) => {
            let keep = RetentionSet::for_date(job.created_at.date());
            let report = retention::sweep(store.as_ref(), &settings.remote_prefix, &keep).await;
            if !report.is_clean() {
                warn!(failed = report.failed.len(), "Retention finished with errors");
            }
            Some(report)
        }
        _ => None,
    };

    staging.release();
    info!(artifact = %artifact.logical_name, destination = %target.remote_path, "🎉 Backup job completed");
    Ok(JobReport {
        kind: job.kind,
        artifact_name: artifact.logical_name,
        size_bytes: artifact.size_bytes,
        strategy,
        destination: target.remote_path,
        retention,
    })
}

async fn connect(settings: &PipelineSettings<'_>) -> Result<Arc<dyn ObjectStore>> {
    let connector = settings.connector.ok_or_else(|| {
        BackupError::Config("remote driver selected but no remote store is configured".into())
    })?;
    connector.connect().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::job::Artifact;
    use crate::backup::s3_upload::memory::{FailingConnector, MemoryStore, SharedConnector};
    use crate::backup::upload::PART_SIZE;
    use crate::config::Driver;
    use crate::errors::FailureKind;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    /// Writes `size` bytes (sparse, for the large cases) into the staged path.
    struct FakeProducer {
        size: u64,
        fail: bool,
        /// Time spent "producing" after the file is written.
        stall: Option<Duration>,
    }

    impl FakeProducer {
        fn new(size: u64, fail: bool) -> Self {
            FakeProducer { size, fail, stall: None }
        }
    }

    #[async_trait]
    impl ArtifactProducer for FakeProducer {
        async fn produce(&self, staging: &StagingArea) -> Result<Artifact> {
            if self.fail {
                return Err(BackupError::dump_failed(exit_status(1), b"pg_dump: connection refused"));
            }
            let file = fs::File::create(staging.path()).map_err(|e| BackupError::staging(staging.path(), e))?;
            file.set_len(self.size).map_err(|e| BackupError::staging(staging.path(), e))?;
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            Ok(Artifact {
                local_path: staging.path().to_path_buf(),
                logical_name: staging.path().file_name().unwrap().to_string_lossy().into_owned(),
                size_bytes: self.size,
                source_folders: Vec::new(),
            })
        }
    }

    #[cfg(unix)]
    fn exit_status(code: i32) -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code << 8)
    }

    #[cfg(windows)]
    fn exit_status(code: i32) -> std::process::ExitStatus {
        use std::os::windows::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code as u32)
    }

    fn job(kind: BackupKind, driver: Driver, y: i32, m: u32, d: u32) -> BackupJob {
        BackupJob {
            kind,
            created_at: NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(12, 0, 0).unwrap(),
            driver,
        }
    }

    fn settings<'a>(root: &Path, prefix: &str, connector: Option<&'a dyn ObjectStoreConnector>) -> PipelineSettings<'a> {
        PipelineSettings {
            staging_dir: root.join("app/temp-backups"),
            local_dir: root.join("app/private/backups"),
            remote_prefix: prefix.to_string(),
            connector,
            progress: None,
        }
    }

    #[tokio::test]
    async fn local_dump_is_copied_and_staging_removed() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let job = job(BackupKind::DatabaseDump, Driver::Local, 2024, 3, 1);
        let settings = settings(root.path(), "backups", None);
        let producer = FakeProducer::new(2048, false);
        let name = "backup_shopdb_2024-03-01_120000.sql";

        let report = perform_backup_orchestration(&job, &producer, name, &settings).await?;
        assert_eq!(report.strategy, UploadStrategy::LocalCopy);
        assert!(report.retention.is_none());
        let delivered = root.path().join("app/private/backups").join(name);
        assert_eq!(fs::metadata(&delivered)?.len(), 2048);
        assert!(!settings.staging_dir.join(name).exists());
        assert!(!settings.staging_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn failed_dump_never_uploads_and_cleans_staging() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::default());
        let connector = SharedConnector(store.clone());
        let job = job(BackupKind::DatabaseDump, Driver::Remote("b2".into()), 2024, 3, 1);
        let settings = settings(root.path(), "backups", Some(&connector));
        let producer = FakeProducer::new(0, true);

        let err = perform_backup_orchestration(&job, &producer, "backup_shopdb.sql", &settings)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Producer);
        assert!(store.put_calls.lock().unwrap().is_empty());
        assert!(!settings.staging_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn large_dump_still_uses_a_single_put() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::default());
        let connector = SharedConnector(store.clone());
        let job = job(BackupKind::DatabaseDump, Driver::Remote("b2".into()), 2024, 3, 1);
        let settings = settings(root.path(), "backups", Some(&connector));
        let producer = FakeProducer::new(4096, false);

        let report = perform_backup_orchestration(&job, &producer, "backup_shopdb.sql", &settings).await?;
        assert_eq!(report.strategy, UploadStrategy::SimpleRemotePut);
        assert_eq!(report.destination, "backups/backup_shopdb.sql");
        assert_eq!(*store.put_calls.lock().unwrap(), vec!["backups/backup_shopdb.sql"]);
        assert!(report.retention.is_none());
        assert!(!settings.staging_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn large_remote_archive_goes_multipart_then_sweeps() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::with_objects(&[
            "backup-files/lbackup_storage_2024_02_28.zip",
            "backup-files/lbackup_storage_2024_02_29.zip",
            "backup-files/keep-me.txt",
        ]));
        let connector = SharedConnector(store.clone());
        let job = job(BackupKind::StorageArchive, Driver::Remote("b2".into()), 2024, 3, 1);
        let mut settings = settings(root.path(), "backup-files", Some(&connector));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        settings.progress = Some(tx);
        let producer = FakeProducer::new(600 * 1024 * 1024, false);

        let report =
            perform_backup_orchestration(&job, &producer, "lbackup_storage_2024_03_01.zip", &settings).await?;
        drop(settings);

        assert_eq!(report.strategy, UploadStrategy::MultipartRemoteUpload);
        assert_eq!(store.parts.lock().unwrap().len(), 75);
        assert!(store.parts.lock().unwrap().values().all(|len| *len as u64 == PART_SIZE));

        let mut last = 0;
        while let Some(event) = rx.recv().await {
            assert!(event.completed > last);
            assert_eq!(event.total, 75);
            last = event.completed;
        }
        assert_eq!(last, 75);

        let retention = report.retention.expect("remote archive runs retention");
        assert_eq!(retention.deleted, vec!["backup-files/lbackup_storage_2024_02_28.zip"]);
        assert_eq!(
            store.keys(),
            vec![
                "backup-files/keep-me.txt",
                "backup-files/lbackup_storage_2024_02_29.zip",
                "backup-files/lbackup_storage_2024_03_01.zip",
            ]
        );
        assert!(!root.path().join("app/temp-backups").exists());
        Ok(())
    }

    #[tokio::test]
    async fn local_archive_skips_retention() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let job = job(BackupKind::StorageArchive, Driver::Local, 2024, 3, 1);
        let settings = settings(root.path(), "backup-files", None);
        let producer = FakeProducer::new(10, false);

        let report =
            perform_backup_orchestration(&job, &producer, "lbackup_storage_2024_03_01.zip", &settings).await?;
        assert_eq!(report.strategy, UploadStrategy::LocalCopy);
        assert!(report.retention.is_none());
        assert!(settings.local_dir.join("lbackup_storage_2024_03_01.zip").exists());
        Ok(())
    }

    #[tokio::test]
    async fn upload_failure_fails_the_job_and_still_releases_staging() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore { fail_puts: true, ..Default::default() });
        let connector = SharedConnector(store.clone());
        let job = job(BackupKind::StorageArchive, Driver::Remote("b2".into()), 2024, 3, 1);
        let settings = settings(root.path(), "backup-files", Some(&connector));
        let producer = FakeProducer::new(10, false);

        let err = perform_backup_orchestration(&job, &producer, "lbackup_storage_2024_03_01.zip", &settings)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Upload);
        assert!(store.deleted.lock().unwrap().is_empty());
        assert!(!settings.staging_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn bad_credentials_are_an_upload_failure() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let job = job(BackupKind::DatabaseDump, Driver::Remote("b2".into()), 2024, 3, 1);
        let settings = settings(root.path(), "backups", Some(&FailingConnector));
        let producer = FakeProducer::new(10, false);

        let err = perform_backup_orchestration(&job, &producer, "backup_shopdb.sql", &settings)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Upload);
        assert!(!settings.staging_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn retention_failure_does_not_fail_the_job() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore { fail_list: true, ..Default::default() });
        let connector = SharedConnector(store.clone());
        let job = job(BackupKind::StorageArchive, Driver::Remote("b2".into()), 2024, 3, 1);
        let settings = settings(root.path(), "backup-files", Some(&connector));
        let producer = FakeProducer::new(10, false);

        let report =
            perform_backup_orchestration(&job, &producer, "lbackup_storage_2024_03_01.zip", &settings).await?;
        let retention = report.retention.expect("retention attempted");
        assert!(!retention.is_clean());
        assert_eq!(store.keys(), vec!["backup-files/lbackup_storage_2024_03_01.zip"]);
        Ok(())
    }

    #[tokio::test]
    async fn interrupted_job_still_releases_staging() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let job = job(BackupKind::StorageArchive, Driver::Local, 2024, 3, 1);
        let settings = settings(root.path(), "backup-files", None);
        let producer = FakeProducer { stall: Some(Duration::from_secs(30)), ..FakeProducer::new(64, false) };
        let name = "lbackup_storage_2024_03_01.zip";

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            perform_backup_orchestration(&job, &producer, name, &settings),
        )
        .await;
        assert!(outcome.is_err());
        assert!(!settings.staging_dir.join(name).exists());
        assert!(!settings.staging_dir.exists());
        assert!(!settings.local_dir.join(name).exists());
        Ok(())
    }
}
