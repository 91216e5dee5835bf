// lbackup/src/backup/db_dump.rs
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use which::which;

use crate::backup::job::{Artifact, ArtifactProducer};
use crate::backup::process::{CommandSpec, run_bounded};
use crate::backup::staging::StagingArea;
use crate::config::DatabaseConfig;
use crate::errors::{BackupError, Result};

/// Upper bound for a single dump run.
pub const DUMP_TIMEOUT: Duration = Duration::from_secs(3600);

/// Inside the container the database is reached over its own loopback interface.
const CONTAINER_DB_HOST: &str = "127.0.0.1";

/// Runs `pg_dump`, directly or through `docker exec`, and stages its stdout as the dump file.
pub struct DatabaseDumpProducer {
    database: DatabaseConfig,
    database_name: String,
    container: Option<String>,
    program: Option<PathBuf>,
    timeout: Duration,
}

impl DatabaseDumpProducer {
    pub fn new(database: DatabaseConfig, container: Option<String>) -> Result<Self> {
        let database_name = database
            .database
            .clone()
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| BackupError::Config("DB_DATABASE must be set to dump the database".into()))?;
        Ok(DatabaseDumpProducer {
            database,
            database_name,
            container: container.filter(|c| !c.trim().is_empty()),
            program: None,
            timeout: DUMP_TIMEOUT,
        })
    }

    /// Uses `program` instead of looking up `pg_dump`/`docker` in PATH.
    #[cfg(test)]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    fn resolve_program(&self) -> Result<PathBuf> {
        if let Some(program) = &self.program {
            return Ok(program.clone());
        }
        let name = if self.container.is_some() { "docker" } else { "pg_dump" };
        which(name).map_err(|e| {
            BackupError::DumpSpawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} executable not found in PATH: {}", name, e),
            ))
        })
    }

    /// The exact command line for this dump, given the resolved executable.
    pub fn command(&self, program: PathBuf) -> CommandSpec {
        let db = &self.database;
        match &self.container {
            Some(container) => CommandSpec::new(program)
                .secret_env("PGPASSWORD", db.password.clone())
                .arg("exec")
                .arg("-e")
                // Without a value docker forwards PGPASSWORD from our own environment.
                .arg("PGPASSWORD")
                .arg(container)
                .arg("pg_dump")
                .arg("-h")
                .arg(CONTAINER_DB_HOST)
                .arg("-p")
                .arg(db.port.to_string())
                .arg("-U")
                .arg(&db.username)
                .arg("-d")
                .arg(&self.database_name),
            None => CommandSpec::new(program)
                .secret_env("PGPASSWORD", db.password.clone())
                .arg("-h")
                .arg(&db.host)
                .arg("-p")
                .arg(db.port.to_string())
                .arg("-U")
                .arg(&db.username)
                .arg("-d")
                .arg(&self.database_name),
        }
    }
}

#[async_trait]
impl ArtifactProducer for DatabaseDumpProducer {
    async fn produce(&self, staging: &StagingArea) -> Result<Artifact> {
        match &self.container {
            Some(container) => info!(container = %container, "Running pg_dump inside container"),
            None => info!(host = %self.database.host, "Running pg_dump against host"),
        }

        let spec = self.command(self.resolve_program()?);
        info!(command = %spec, "Dump command prepared");

        let output = run_bounded(&spec, self.timeout).await?;
        if !output.status.success() {
            let err = BackupError::dump_failed(output.status, &output.stderr);
            error!(database = %self.database_name, error = %err, "pg_dump failed");
            return Err(err);
        }

        let path = staging.path().to_path_buf();
        tokio::fs::write(&path, &output.stdout)
            .await
            .map_err(|e| BackupError::staging(&path, e))?;
        let size_bytes = tokio::fs::metadata(&path)
            .await
            .map_err(|e| BackupError::staging(&path, e))?
            .len();

        info!(path = %path.display(), size_bytes, "✓ SQL dump written to staging");
        Ok(Artifact {
            logical_name: staging
                .path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            local_path: path,
            size_bytes,
            source_folders: Vec::new(),
        })
    }
}
