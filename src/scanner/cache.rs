use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use super::FileMatch;
use crate::common::{PurgeError, PurgeResult};

/// Cheap structural signature of a root directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub mtime_nanos: u64,
    pub child_count: u64,
}

impl Fingerprint {
    /// Root mtime plus the number of direct children
    pub fn of(root: &Path) -> PurgeResult<Self> {
        let metadata = std::fs::metadata(root).map_err(|e| PurgeError::io(root, e))?;
        let mtime_nanos = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let child_count = std::fs::read_dir(root)
            .map_err(|e| PurgeError::io(root, e))?
            .count() as u64;
        Ok(Self {
            mtime_nanos,
            child_count,
        })
    }
}

/// Cached scan result for one (identity, root) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub identity: String,
    pub root: PathBuf,
    pub fingerprint: Fingerprint,
    pub scanned_at: chrono::DateTime<chrono::Utc>,
    pub matches: Vec<FileMatch>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub invalidated: usize,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

type CacheKey = (String, PathBuf);

/// Scan cache shared by the scan workers of a job.
///
/// Entries live in a sharded map so distinct roots never contend. Work on
/// a single root is serialized through [`CacheStore::root_lock`]. The
/// store is opened explicitly and persisted on [`CacheStore::flush`].
pub struct CacheStore {
    path: Option<PathBuf>,
    entries: DashMap<CacheKey, CacheEntry>,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    max_age: chrono::Duration,
    hits: AtomicUsize,
    misses: AtomicUsize,
    invalidated: AtomicUsize,
    dirty: AtomicBool,
}

impl CacheStore {
    /// Open a persisted cache; a missing file gives an empty store and a
    /// corrupt one is discarded with a warning
    pub fn open(path: impl Into<PathBuf>) -> PurgeResult<Self> {
        let path = path.into();
        let store = Self::empty(Some(path.clone()));

        if path.exists() {
            let contents =
                std::fs::read_to_string(&path).map_err(|e| PurgeError::io(&path, e))?;
            match serde_json::from_str::<Vec<CacheEntry>>(&contents) {
                Ok(entries) => {
                    for entry in entries {
                        store
                            .entries
                            .insert((entry.identity.clone(), entry.root.clone()), entry);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "discarding unreadable scan cache");
                    store.dirty.store(true, Ordering::Relaxed);
                }
            }
        }
        tracing::debug!(path = %path.display(), entries = store.entries.len(), "scan cache opened");
        Ok(store)
    }

    /// Cache that is never persisted
    pub fn in_memory() -> Self {
        Self::empty(None)
    }

    fn empty(path: Option<PathBuf>) -> Self {
        Self {
            path,
            entries: DashMap::new(),
            locks: DashMap::new(),
            max_age: chrono::Duration::hours(24),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            invalidated: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    /// Entries older than this are treated as misses
    pub fn with_max_age(mut self, max_age: chrono::Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Per-root lock held across fingerprint, lookup, walk and store
    pub fn root_lock(&self, root: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(root.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Cached matches for a root; never served when the fingerprint changed
    pub fn lookup(&self, identity: &str, root: &Path, fingerprint: &Fingerprint) -> Option<Vec<FileMatch>> {
        let key = (identity.to_string(), root.to_path_buf());

        // The read guard must be released before a stale entry is removed.
        let verdict = self.entries.get(&key).map(|entry| {
            let fresh = chrono::Utc::now() - entry.scanned_at <= self.max_age;
            if entry.fingerprint == *fingerprint && fresh {
                Some(entry.matches.clone())
            } else {
                None
            }
        });

        match verdict {
            Some(Some(matches)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(matches)
            }
            Some(None) => {
                self.entries.remove(&key);
                self.invalidated.fetch_add(1, Ordering::Relaxed);
                self.dirty.store(true, Ordering::Relaxed);
                tracing::debug!(root = %root.display(), "stale cache entry dropped");
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn store(&self, identity: &str, root: &Path, fingerprint: Fingerprint, matches: Vec<FileMatch>) {
        let entry = CacheEntry {
            identity: identity.to_string(),
            root: root.to_path_buf(),
            fingerprint,
            scanned_at: chrono::Utc::now(),
            matches,
        };
        self.entries.insert((identity.to_string(), root.to_path_buf()), entry);
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Drop every identity's entry for a root
    pub fn invalidate(&self, root: &Path) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.1 != root);
        let dropped = before.saturating_sub(self.entries.len());
        if dropped > 0 {
            self.invalidated.fetch_add(dropped, Ordering::Relaxed);
            self.dirty.store(true, Ordering::Relaxed);
        }
        dropped
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    /// Write pending changes to disk (no-op for in-memory stores)
    pub fn flush(&self) -> PurgeResult<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }

        let mut entries: Vec<CacheEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| (&a.identity, &a.root).cmp(&(&b.identity, &b.root)));

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PurgeError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(&entries).map_err(|e| PurgeError::Io {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| PurgeError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| PurgeError::io(path, e))?;
        tracing::debug!(path = %path.display(), entries = entries.len(), "scan cache flushed");
        Ok(())
    }

    pub fn close(self) -> PurgeResult<()> {
        self.flush()
    }
}
