// lbackup/src/backup/retention.rs
use tracing::{error, info, warn};

use crate::backup::naming::RetentionSet;
use crate::backup::s3_upload::{ObjectStore, folder_prefix};

/// Outcome of one sweep. Failures are recorded here instead of failing the job.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub listing_error: Option<String>,
}

impl RetentionReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.listing_error.is_none()
    }
}

/// Deletes every archive under `folder` whose name is not in `keep`.
///
/// Keys whose basename does not match the archive pattern are never touched. Each deletion
/// is attempted independently.
pub async fn sweep(store: &dyn ObjectStore, folder: &str, keep: &RetentionSet) -> RetentionReport {
    info!(folder = %folder, keep = ?keep.names().collect::<Vec<_>>(), "Removing old archives from remote store");
    let mut report = RetentionReport::default();

    let keys = match store.list(folder).await {
        Ok(keys) => keys,
        Err(e) => {
            error!(folder = %folder, error = %e, "Failed to list remote archives; skipping retention");
            report.listing_error = Some(e.to_string());
            return report;
        }
    };

    let folder = folder_prefix(folder);
    for key in keys {
        // Only archives directly in the folder; nested folders are kept by hand.
        let Some(basename) = key.strip_prefix(&folder).filter(|rest| !rest.contains('/')) else {
            continue;
        };
        if !keep.should_delete(basename) {
            continue;
        }
        match store.delete(&key).await {
            Ok(()) => {
                info!(key = %key, "Old archive deleted");
                report.deleted.push(key);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to delete old archive");
                report.failed.push((key, e.to_string()));
            }
        }
    }
    report
}
