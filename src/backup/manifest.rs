use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::common::{PurgeError, PurgeResult};
use crate::scanner::walker::EntryKind;

/// One path captured in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Where the entry lived before removal
    pub original_path: PathBuf,

    /// Member name inside the archive (files only)
    pub archive_path: Option<String>,

    /// SHA-256 of the file bytes (files only)
    pub checksum: Option<String>,

    /// Unix permission bits
    pub mode: u32,

    pub kind: EntryKind,

    pub size_bytes: u64,

    /// Target of a symlink
    pub link_target: Option<PathBuf>,
}

/// Who produced a snapshot; stored for listing only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotLabel {
    pub bundle_id: String,
    pub app_name: String,
    pub mode: String,
}

/// The sealed description of a snapshot. Stored as `manifest.json`
/// both inside the archive and next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// First 16 hex chars of `entries_sha256`
    pub id: String,

    pub created_at: DateTime<Utc>,

    pub label: SnapshotLabel,

    /// Sum of file sizes
    pub total_bytes: u64,

    /// SHA-256 over the serialized `entries`
    pub entries_sha256: String,

    pub entries: Vec<ManifestEntry>,
}

impl SnapshotManifest {
    pub fn new(label: SnapshotLabel, entries: Vec<ManifestEntry>) -> PurgeResult<Self> {
        let entries_sha256 = entries_hash(&entries)?;
        let total_bytes = entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.size_bytes)
            .sum();
        Ok(Self {
            id: entries_sha256[..16].to_string(),
            created_at: Utc::now(),
            label,
            total_bytes,
            entries_sha256,
            entries,
        })
    }

    /// Recompute the entries hash and check it against the stored hash and id
    pub fn verify(&self) -> PurgeResult<()> {
        let actual = entries_hash(&self.entries)?;
        if actual != self.entries_sha256 || !actual.starts_with(&self.id) || self.id.len() != 16 {
            return Err(PurgeError::SnapshotCorrupt {
                snapshot_id: self.id.clone(),
                message: "manifest hash does not match its entries".into(),
            });
        }
        Ok(())
    }

    pub fn file_count(&self) -> usize {
        self.entries.iter().filter(|e| e.kind == EntryKind::File).count()
    }

    pub fn is_expired(&self, retention_days: u32) -> bool {
        Utc::now() > self.created_at + Duration::days(retention_days as i64)
    }

    pub fn to_json(&self) -> PurgeResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| PurgeError::SnapshotCorrupt {
            snapshot_id: self.id.clone(),
            message: format!("cannot serialize manifest: {}", e),
        })
    }

    pub fn from_json(snapshot_id: &str, json: &str) -> PurgeResult<Self> {
        serde_json::from_str(json).map_err(|e| PurgeError::SnapshotCorrupt {
            snapshot_id: snapshot_id.to_string(),
            message: format!("unreadable manifest: {}", e),
        })
    }

    /// Load `manifest.json` from a snapshot directory
    pub fn load(dir: &Path) -> PurgeResult<Self> {
        let id = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let path = dir.join("manifest.json");
        let contents = std::fs::read_to_string(&path).map_err(|e| PurgeError::io(&path, e))?;
        Self::from_json(&id, &contents)
    }
}

/// Summary info about a snapshot (for listing)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub bundle_id: String,
    pub app_name: String,
    pub mode: String,
    pub entry_count: usize,
    pub file_count: usize,
    pub total_bytes: u64,
    /// Size of the compressed archive on disk
    pub archive_bytes: u64,
}

impl SnapshotSummary {
    pub fn from_manifest(manifest: &SnapshotManifest, archive_bytes: u64) -> Self {
        Self {
            id: manifest.id.clone(),
            created_at: manifest.created_at,
            bundle_id: manifest.label.bundle_id.clone(),
            app_name: manifest.label.app_name.clone(),
            mode: manifest.label.mode.clone(),
            entry_count: manifest.entries.len(),
            file_count: manifest.file_count(),
            total_bytes: manifest.total_bytes,
            archive_bytes,
        }
    }
}

fn entries_hash(entries: &[ManifestEntry]) -> PurgeResult<String> {
    let bytes = serde_json::to_vec(entries).map_err(|e| PurgeError::SnapshotCorrupt {
        snapshot_id: String::new(),
        message: format!("cannot serialize entries: {}", e),
    })?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Full SHA-256 of a file
pub fn sha256_file(path: &Path) -> PurgeResult<String> {
    let file = File::open(path).map_err(|e| PurgeError::io(path, e))?;
    let mut reader = BufReader::with_capacity(1024 * 1024, file);
    sha256_reader(&mut reader).map_err(|e| PurgeError::io(path, e))
}

pub fn sha256_reader(reader: &mut impl Read) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
