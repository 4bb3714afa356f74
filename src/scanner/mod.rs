pub mod cache;
pub mod catalog;
pub mod classifier;
pub mod matcher;
pub mod walker;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use crate::apps::ApplicationIdentity;
use cache::{CacheStore, Fingerprint};
use catalog::{PathCatalog, SearchRoot};
use matcher::Strategy;
use walker::{EntryKind, Locator, LocatorEvent, ScanWarning};

pub use classifier::{classify, Classification};

/// A filesystem entry attributed to an application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMatch {
    pub path: PathBuf,
    /// Logical bytes; directories report the size of their whole tree
    pub size_bytes: u64,
    pub modified: Option<chrono::DateTime<chrono::Utc>>,
    pub kind: EntryKind,
    pub matched_by: BTreeSet<Strategy>,
    pub confidence: f64,
    #[serde(default)]
    pub protected: bool,
}

/// Everything one scan produced
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Sorted by path, unique
    pub matches: Vec<FileMatch>,
    pub warnings: Vec<ScanWarning>,
    pub roots_scanned: usize,
    pub cache_hits: usize,
    pub duration_secs: f64,
}

/// Scan every search root of an application in parallel.
///
/// Each rayon worker owns one root. With a cache, the worker holds that
/// root's lock from fingerprinting until the fresh result is stored.
pub fn scan_identity(
    identity: &ApplicationIdentity,
    catalog: &PathCatalog,
    cache: Option<&CacheStore>,
    max_depth: usize,
) -> ScanOutcome {
    let start = Instant::now();
    let roots = catalog.roots(identity);
    let boundaries: Vec<PathBuf> = roots.iter().map(|r| r.path.clone()).collect();

    let matches = Mutex::new(Vec::new());
    let warnings = Mutex::new(Vec::new());
    let hits = std::sync::atomic::AtomicUsize::new(0);

    roots.par_iter().for_each(|root| {
        let (found, warned, hit) = scan_root(identity, root, catalog, &boundaries, cache, max_depth);
        if hit {
            hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        lock(&matches).extend(found);
        lock(&warnings).extend(warned);
    });

    let mut matches = matches.into_inner().unwrap_or_else(|e| e.into_inner());
    matches.sort_by(|a, b| a.path.cmp(&b.path));
    matches.dedup_by(|a, b| a.path == b.path);
    let mut warnings = warnings.into_inner().unwrap_or_else(|e| e.into_inner());
    warnings.sort_by(|a, b| a.path.cmp(&b.path));

    let outcome = ScanOutcome {
        matches,
        warnings,
        roots_scanned: roots.len(),
        cache_hits: hits.into_inner(),
        duration_secs: start.elapsed().as_secs_f64(),
    };
    tracing::info!(
        app = %identity.bundle_id,
        roots = outcome.roots_scanned,
        matches = outcome.matches.len(),
        warnings = outcome.warnings.len(),
        cache_hits = outcome.cache_hits,
        "scan finished"
    );
    outcome
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn scan_root(
    identity: &ApplicationIdentity,
    root: &SearchRoot,
    catalog: &PathCatalog,
    boundaries: &[PathBuf],
    cache: Option<&CacheStore>,
    max_depth: usize,
) -> (Vec<FileMatch>, Vec<ScanWarning>, bool) {
    let root_lock = cache.map(|c| c.root_lock(&root.path));
    let _guard = root_lock.as_ref().map(|l| lock(l.as_ref()));

    let key = identity.cache_key();
    let fingerprint = match cache {
        Some(_) => match Fingerprint::of(&root.path) {
            Ok(fp) => Some(fp),
            Err(e) => {
                tracing::warn!(root = %root.path.display(), error = %e, "cannot fingerprint root");
                None
            }
        },
        None => None,
    };

    if let (Some(cache), Some(fp)) = (cache, fingerprint.as_ref()) {
        if let Some(hit) = cache.lookup(&key, &root.path, fp) {
            tracing::debug!(root = %root.path.display(), matches = hit.len(), "cache hit");
            return (hit, Vec::new(), true);
        }
    }

    let mut found = Vec::new();
    let mut warnings = Vec::new();
    let mut locator = Locator::new(vec![root.clone()], catalog.exclusions().to_vec(), max_depth)
        .with_boundaries(boundaries.to_vec());

    while let Some(event) = locator.next() {
        match event {
            LocatorEvent::Entry(candidate) => {
                let score = matcher::score(&candidate, identity);
                if !score.is_match() {
                    continue;
                }
                let is_dir = candidate.kind == EntryKind::Directory;
                if is_dir {
                    // The whole directory is one match
                    locator.skip_current_dir();
                }
                tracing::debug!(
                    path = %candidate.path.display(),
                    confidence = score.confidence,
                    "candidate matched"
                );
                found.push(FileMatch {
                    size_bytes: if is_dir {
                        walker::dir_size(&candidate.path)
                    } else {
                        candidate.size_bytes
                    },
                    modified: candidate.modified.map(chrono::DateTime::<chrono::Utc>::from),
                    kind: candidate.kind,
                    matched_by: score.matched_by,
                    confidence: score.confidence,
                    protected: false,
                    path: candidate.path,
                });
            }
            LocatorEvent::Warning(w) => warnings.push(w),
        }
    }

    // Results with soft failures are not cached so the next run retries them
    if let (Some(cache), Some(fp)) = (cache, fingerprint) {
        if warnings.is_empty() {
            cache.store(&key, &root.path, fp, found.clone());
        }
    }
    (found, warnings, false)
}
