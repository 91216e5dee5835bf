use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Largest stderr tail kept in a `DumpFailed` diagnostic.
const STDERR_EXCERPT_BYTES: usize = 2048;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dump command failed with {status}: {stderr}")]
    DumpFailed { status: ExitStatus, stderr: String },

    #[error("Dump command timed out after {seconds} seconds")]
    DumpTimedOut { seconds: u64 },

    #[error("Failed to launch dump command: {0}")]
    DumpSpawn(#[source] std::io::Error),

    #[error("Failed to write staged artifact {}: {source}", path.display())]
    StagingWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create archive {}: {reason}", path.display())]
    ArchiveCreateFailed { path: PathBuf, reason: String },

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Remote store error: {0}")]
    Remote(String),
}

/// Coarse classification of a [`BackupError`], mirroring the pipeline stage that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Config,
    Producer,
    StagingIo,
    Upload,
}

impl BackupError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BackupError::Config(_) => FailureKind::Config,
            BackupError::DumpFailed { .. }
            | BackupError::DumpTimedOut { .. }
            | BackupError::DumpSpawn(_)
            | BackupError::ArchiveCreateFailed { .. } => FailureKind::Producer,
            BackupError::StagingWriteFailed { .. } => FailureKind::StagingIo,
            BackupError::Upload(_) | BackupError::Remote(_) => FailureKind::Upload,
        }
    }

    pub fn dump_failed(status: ExitStatus, stderr: &[u8]) -> Self {
        BackupError::DumpFailed {
            status,
            stderr: stderr_excerpt(stderr),
        }
    }

    pub fn staging(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::StagingWriteFailed {
            path: path.into(),
            source,
        }
    }
}

/// Keeps the tail of stderr, where pg_dump puts the actual failure reason.
fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_EXCERPT_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_EXCERPT_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_stderr_is_kept_whole() {
        assert_eq!(stderr_excerpt(b"  pg_dump: error: connection refused\n"), "pg_dump: error: connection refused");
    }

    #[test]
    fn long_stderr_keeps_the_tail() {
        let mut noise = "x".repeat(5000);
        noise.push_str("FATAL: password authentication failed");
        let excerpt = stderr_excerpt(noise.as_bytes());
        assert!(excerpt.starts_with("..."));
        assert!(excerpt.ends_with("FATAL: password authentication failed"));
        assert_eq!(excerpt.len(), STDERR_EXCERPT_BYTES + 3);
    }

    #[test]
    fn errors_are_classified_by_stage() {
        let io = || std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(BackupError::DumpTimedOut { seconds: 3600 }.kind(), FailureKind::Producer);
        assert_eq!(BackupError::staging("/tmp/x.sql", io()).kind(), FailureKind::StagingIo);
        assert_eq!(BackupError::Upload("quota".into()).kind(), FailureKind::Upload);
        assert_eq!(BackupError::Config("no db".into()).kind(), FailureKind::Config);
    }
}
