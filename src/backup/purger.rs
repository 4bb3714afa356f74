use serde::Serialize;
use std::fs;
use std::path::Path;

use super::manifest::SnapshotManifest;
use crate::common::{PurgeError, PurgeResult};
use crate::scanner::walker::dir_size;

/// Report from a purge operation
#[derive(Debug, Default, Serialize)]
pub struct PurgeReport {
    pub purged: Vec<PurgedSnapshot>,
    pub total_bytes_freed: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PurgedSnapshot {
    pub id: String,
    pub bytes_freed: u64,
}

impl PurgeReport {
    fn record(&mut self, id: String, dir: &Path) {
        let size = dir_size(dir);
        match fs::remove_dir_all(dir) {
            Ok(()) => {
                tracing::info!(snapshot = %id, bytes = size, "snapshot purged");
                self.purged.push(PurgedSnapshot { id, bytes_freed: size });
                self.total_bytes_freed += size;
            }
            Err(e) => self.errors.push(format!("Failed to purge '{}': {}", id, e)),
        }
    }
}

/// Remove one snapshot directory, returning the bytes freed
pub fn purge(dir: &Path, snapshot_id: &str) -> PurgeResult<u64> {
    if !dir.is_dir() {
        return Err(PurgeError::SnapshotNotFound {
            snapshot_id: snapshot_id.to_string(),
        });
    }
    let size = dir_size(dir);
    fs::remove_dir_all(dir).map_err(|e| PurgeError::io(dir, e))?;
    tracing::info!(snapshot = snapshot_id, bytes = size, "snapshot purged");
    Ok(size)
}

/// Remove snapshots older than the retention window.
///
/// Snapshots whose manifest cannot be read are left alone; they may be
/// restorable from the copy inside the archive.
pub fn purge_expired(root: &Path, retention_days: u32) -> PurgeResult<PurgeReport> {
    let mut report = PurgeReport::default();
    if !root.exists() {
        return Ok(report);
    }

    for entry in fs::read_dir(root).map_err(|e| PurgeError::io(root, e))? {
        let entry = entry.map_err(|e| PurgeError::io(root, e))?;
        let path = entry.path();
        let id = entry.file_name().to_string_lossy().to_string();
        if !path.is_dir() || id.starts_with('.') {
            continue;
        }

        match SnapshotManifest::load(&path) {
            Ok(manifest) if manifest.is_expired(retention_days) => report.record(id, &path),
            Ok(_) => {}
            Err(e) => tracing::warn!(snapshot = %id, error = %e, "skipping unreadable snapshot"),
        }
    }
    Ok(report)
}

/// Remove every snapshot, plus leftovers of interrupted seals
pub fn purge_all(root: &Path) -> PurgeResult<PurgeReport> {
    let mut report = PurgeReport::default();
    if !root.exists() {
        return Ok(report);
    }

    for entry in fs::read_dir(root).map_err(|e| PurgeError::io(root, e))? {
        let entry = entry.map_err(|e| PurgeError::io(root, e))?;
        let path = entry.path();
        if path.is_dir() {
            report.record(entry.file_name().to_string_lossy().to_string(), &path);
        }
    }
    Ok(report)
}
