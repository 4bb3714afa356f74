//! Sealed snapshots of everything an uninstall is about to remove.
//!
//! Layout: `<root>/<id>/{archive.zip,manifest.json}` where `id` is derived
//! from the content hash of the manifest entries.

pub mod archive;
pub mod manifest;
pub mod purger;

use std::path::{Path, PathBuf};

use crate::common::{PurgeError, PurgeResult};
use crate::scanner::FileMatch;

pub use archive::{RestoreFailure, RestoreReport};
pub use manifest::{ManifestEntry, SnapshotLabel, SnapshotManifest, SnapshotSummary};
pub use purger::{PurgeReport, PurgedSnapshot};

/// A sealed snapshot on disk
#[derive(Debug, Clone)]
pub struct BackupSnapshot {
    pub manifest: SnapshotManifest,
    pub dir: PathBuf,
}

impl BackupSnapshot {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn archive_path(&self) -> PathBuf {
        self.dir.join(archive::ARCHIVE_NAME)
    }
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot every matched path. Fails without leaving anything behind.
    pub fn seal(&self, matches: &[FileMatch], label: SnapshotLabel) -> PurgeResult<BackupSnapshot> {
        let paths: Vec<PathBuf> = matches.iter().map(|m| m.path.clone()).collect();
        let manifest = archive::seal(&self.root, &paths, label)?;
        Ok(BackupSnapshot {
            dir: self.root.join(&manifest.id),
            manifest,
        })
    }

    /// Load a snapshot's manifest, falling back to the copy in the archive
    pub fn load(&self, snapshot_id: &str) -> PurgeResult<SnapshotManifest> {
        let dir = self.snapshot_dir(snapshot_id)?;
        let manifest = match SnapshotManifest::load(&dir) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(snapshot = snapshot_id, error = %e, "manifest unreadable, using archive copy");
                archive::read_embedded_manifest(&dir, snapshot_id)?
            }
        };
        if manifest.id != snapshot_id {
            return Err(PurgeError::SnapshotCorrupt {
                snapshot_id: snapshot_id.to_string(),
                message: format!("manifest belongs to snapshot '{}'", manifest.id),
            });
        }
        Ok(manifest)
    }

    pub fn restore(&self, snapshot_id: &str) -> PurgeResult<RestoreReport> {
        let manifest = self.load(snapshot_id)?;
        archive::restore(&self.root.join(snapshot_id), &manifest)
    }

    /// Every readable snapshot, newest first
    pub fn list(&self) -> PurgeResult<Vec<SnapshotSummary>> {
        let mut summaries = Vec::new();
        if !self.root.exists() {
            return Ok(summaries);
        }

        for entry in std::fs::read_dir(&self.root).map_err(|e| PurgeError::io(&self.root, e))? {
            let entry = entry.map_err(|e| PurgeError::io(&self.root, e))?;
            let id = entry.file_name().to_string_lossy().to_string();
            if !entry.path().is_dir() || id.starts_with('.') {
                continue;
            }
            match self.load(&id) {
                Ok(manifest) => {
                    let archive_bytes = std::fs::metadata(entry.path().join(archive::ARCHIVE_NAME))
                        .map(|m| m.len())
                        .unwrap_or(0);
                    summaries.push(SnapshotSummary::from_manifest(&manifest, archive_bytes));
                }
                Err(e) => tracing::warn!(snapshot = %id, error = %e, "skipping unreadable snapshot"),
            }
        }

        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    pub fn purge(&self, snapshot_id: &str) -> PurgeResult<u64> {
        let dir = self.snapshot_dir(snapshot_id)?;
        purger::purge(&dir, snapshot_id)
    }

    pub fn purge_expired(&self, retention_days: u32) -> PurgeResult<PurgeReport> {
        purger::purge_expired(&self.root, retention_days)
    }

    pub fn purge_all(&self) -> PurgeResult<PurgeReport> {
        purger::purge_all(&self.root)
    }

    /// Directory of a snapshot id. Ids are 16 lowercase hex chars; anything
    /// else cannot name a snapshot.
    fn snapshot_dir(&self, snapshot_id: &str) -> PurgeResult<PathBuf> {
        let well_formed = snapshot_id.len() == 16
            && snapshot_id
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        let dir = self.root.join(snapshot_id);
        if !well_formed || !dir.is_dir() {
            return Err(PurgeError::SnapshotNotFound {
                snapshot_id: snapshot_id.to_string(),
            });
        }
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::walker::EntryKind;
    use std::collections::BTreeSet;

    fn file_match(path: &Path) -> FileMatch {
        FileMatch {
            path: path.to_path_buf(),
            size_bytes: 0,
            modified: None,
            kind: EntryKind::Directory,
            matched_by: BTreeSet::new(),
            confidence: 1.0,
            protected: false,
        }
    }

    #[test]
    fn test_list_newest_first_and_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        std::fs::write(a.join("f"), b"1").unwrap();
        std::fs::write(b.join("f"), b"2").unwrap();

        let manager = BackupManager::new(tmp.path().join("snapshots"));
        let first = manager.seal(&[file_match(&a)], SnapshotLabel::default()).unwrap();
        let second = manager.seal(&[file_match(&b)], SnapshotLabel::default()).unwrap();

        let list = manager.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, second.id());
        assert_eq!(list[1].id, first.id());
        assert!(list[0].archive_bytes > 0);
        assert_eq!(manager.load(first.id()).unwrap(), first.manifest);
    }

    #[test]
    fn test_load_falls_back_to_archive_manifest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = tmp.path().join("a");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::write(a.join("f"), b"1").unwrap();

        let manager = BackupManager::new(tmp.path().join("snapshots"));
        let snapshot = manager.seal(&[file_match(&a)], SnapshotLabel::default()).unwrap();
        std::fs::remove_file(snapshot.dir.join("manifest.json")).unwrap();

        assert_eq!(manager.load(snapshot.id()).unwrap(), snapshot.manifest);
    }

    #[test]
    fn test_unknown_or_malformed_id() {
        let tmp = tempfile::TempDir::new().unwrap();
        let manager = BackupManager::new(tmp.path());
        assert_eq!(manager.restore("../../etc").unwrap_err().kind(), "snapshot_not_found");
        assert_eq!(manager.purge("0123456789abcdef").unwrap_err().kind(), "snapshot_not_found");
    }
}
