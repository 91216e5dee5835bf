// lbackup/src/backup/mod.rs
mod archive;
mod db_dump;
mod job;
mod logic;
mod naming;
mod process;
mod retention;
mod s3_upload;
mod staging;
mod upload;

pub use logic::JobReport;
pub use upload::UploadProgress;

use chrono::Local;

use crate::config::AppConfig;
use crate::errors::Result;
use archive::StorageArchiveProducer;
use db_dump::DatabaseDumpProducer;
use job::{BackupJob, BackupKind};
use logic::{PipelineSettings, perform_backup_orchestration};
use s3_upload::ObjectStoreConnector;
use upload::ProgressSender;

/// Dumps the configured PostgreSQL database and delivers the `.sql` file.
pub async fn run_database_backup(app_config: &AppConfig, progress: Option<ProgressSender>) -> Result<JobReport> {
    let job = BackupJob {
        kind: BackupKind::DatabaseDump,
        created_at: Local::now().naive_local(),
        driver: app_config.driver.clone(),
    };
    let producer = DatabaseDumpProducer::new(
        app_config.database.clone(),
        app_config.docker_container_name.clone(),
    )?;
    let file_name = naming::dump_file_name(producer.database_name(), job.created_at);

    let settings = PipelineSettings {
        staging_dir: app_config.dump_staging_dir(),
        local_dir: app_config.local_dump_dir(),
        remote_prefix: app_config.db_remote_path.clone(),
        connector: connector(app_config),
        progress,
    };
    perform_backup_orchestration(&job, &producer, &file_name, &settings).await
}

/// Zips the application's private and public storage trees, delivers the archive and,
/// for remote drivers, prunes archives older than yesterday.
pub async fn run_storage_backup(app_config: &AppConfig, progress: Option<ProgressSender>) -> Result<JobReport> {
    let job = BackupJob {
        kind: BackupKind::StorageArchive,
        created_at: Local::now().naive_local(),
        driver: app_config.driver.clone(),
    };
    let producer = StorageArchiveProducer::new(app_config.archive_sources(), &app_config.storage_root);
    let file_name = naming::archive_file_name(job.created_at.date());

    let settings = PipelineSettings {
        staging_dir: app_config.archive_staging_dir(),
        local_dir: app_config.local_archive_dir(),
        remote_prefix: app_config.storage_remote_path.clone(),
        connector: connector(app_config),
        progress,
    };
    perform_backup_orchestration(&job, &producer, &file_name, &settings).await
}

fn connector(app_config: &AppConfig) -> Option<&dyn ObjectStoreConnector> {
    app_config
        .remote
        .as_ref()
        .map(|remote| remote as &dyn ObjectStoreConnector)
}
