// lbackup/src/backup/staging.rs
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::errors::{BackupError, Result};

/// Reserved local location for one artifact.
///
/// Release runs exactly once: explicitly through [`StagingArea::release`] or, on any other
/// exit path (error return, dropped future on interrupt), from `Drop`. It deletes the artifact
/// if it is still there, then removes the directory only when nothing else is left in it.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
    file: PathBuf,
    released: bool,
}

impl StagingArea {
    pub fn acquire(dir: &Path, file_name: &str) -> Result<Self> {
        create_staging_dir(dir).map_err(|e| BackupError::staging(dir, e))?;
        Ok(StagingArea {
            dir: dir.to_path_buf(),
            file: dir.join(file_name),
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match fs::remove_file(&self.file) {
            Ok(()) => info!(path = %self.file.display(), "Temporary artifact removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.file.display(), error = %e, "Failed to remove temporary artifact"),
        }

        match dir_is_empty(&self.dir) {
            Ok(true) => match fs::remove_dir(&self.dir) {
                Ok(()) => debug!(dir = %self.dir.display(), "Staging directory removed"),
                Err(e) => warn!(dir = %self.dir.display(), error = %e, "Failed to remove staging directory"),
            },
            Ok(false) => debug!(dir = %self.dir.display(), "Staging directory not empty, leaving it"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "Failed to inspect staging directory"),
        }
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        self.release();
    }
}

fn dir_is_empty(dir: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(dir)?.next().is_none())
}

#[cfg(unix)]
fn create_staging_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

#[cfg(not(unix))]
fn create_staging_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}
