use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::{DirEntry, FilterEntry, WalkDir};

use super::catalog::SearchRoot;
use crate::common::PurgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// A filesystem entry found under a search root
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    /// Logical size for files and links, 0 for directories
    pub size_bytes: u64,
    pub modified: Option<SystemTime>,
    pub kind: EntryKind,
    pub depth: usize,
    pub root: PathBuf,
}

impl Candidate {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Soft failure encountered while walking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub kind: String,
    pub message: String,
}

impl ScanWarning {
    fn from_error(path: PathBuf, err: PurgeError) -> Self {
        Self {
            path,
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LocatorEvent {
    Entry(Candidate),
    Warning(ScanWarning),
}

type EntryFilter = Box<dyn FnMut(&DirEntry) -> bool + Send>;

/// Lazy walk over a set of search roots.
///
/// Symlinks are never followed. A link is emitted only when its target
/// resolves inside one of the boundary roots. Directories named in the
/// exclusion list, and directories that are themselves another search
/// root, are not descended into.
pub struct Locator {
    roots: Vec<SearchRoot>,
    next_root: usize,
    current: Option<(PathBuf, FilterEntry<walkdir::IntoIter, EntryFilter>)>,
    exclusions: Vec<String>,
    /// Every declared root; nested roots are walked by their own worker
    boundaries: Vec<PathBuf>,
    canonical_boundaries: Vec<PathBuf>,
    max_depth: usize,
}

impl Locator {
    pub fn new(roots: Vec<SearchRoot>, exclusions: Vec<String>, max_depth: usize) -> Self {
        let boundaries = roots.iter().map(|r| r.path.clone()).collect();
        Self {
            roots,
            next_root: 0,
            current: None,
            exclusions,
            boundaries: Vec::new(),
            canonical_boundaries: Vec::new(),
            max_depth,
        }
        .with_boundaries(boundaries)
    }

    /// Widen the set of roots a symlink may point into
    pub fn with_boundaries(mut self, boundaries: Vec<PathBuf>) -> Self {
        self.canonical_boundaries = boundaries
            .iter()
            .map(|b| std::fs::canonicalize(b).unwrap_or_else(|_| b.clone()))
            .collect();
        self.boundaries = boundaries;
        self
    }

    /// Do not descend into the directory last yielded
    pub fn skip_current_dir(&mut self) {
        if let Some((_, walker)) = self.current.as_mut() {
            walker.skip_current_dir();
        }
    }

    fn open_next_root(&mut self) -> bool {
        let Some(root) = self.roots.get(self.next_root).cloned() else {
            return false;
        };
        self.next_root += 1;

        let exclusions = self.exclusions.clone();
        let nested: Vec<PathBuf> = self
            .boundaries
            .iter()
            .filter(|b| **b != root.path && b.starts_with(&root.path))
            .cloned()
            .collect();

        let filter: EntryFilter = Box::new(move |entry: &DirEntry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !exclusions.iter().any(|ex| *ex == name) && !nested.iter().any(|n| n == entry.path())
        });

        let walker = WalkDir::new(&root.path)
            .follow_links(false)
            .min_depth(root.min_depth())
            .max_depth(self.max_depth.max(root.min_depth()))
            .sort_by_file_name()
            .into_iter()
            .filter_entry(filter);

        self.current = Some((root.path, walker));
        true
    }

    fn inside_boundaries(&self, target: &Path) -> bool {
        self.canonical_boundaries.iter().any(|b| target.starts_with(b))
    }

    fn candidate(&self, entry: &DirEntry, root: &Path) -> Result<Candidate, ScanWarning> {
        let path = entry.path().to_path_buf();
        let metadata = entry
            .metadata()
            .map_err(|e| walk_warning(&path, e))?;

        let kind = if entry.path_is_symlink() {
            match std::fs::canonicalize(&path) {
                Ok(target) if self.inside_boundaries(&target) => EntryKind::Symlink,
                Ok(target) => {
                    return Err(ScanWarning {
                        path,
                        kind: "symlink_escape".into(),
                        message: format!("link target '{}' is outside the search roots", target.display()),
                    })
                }
                Err(e) => return Err(ScanWarning::from_error(path.clone(), PurgeError::io(path, e))),
            }
        } else if metadata.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        Ok(Candidate {
            size_bytes: if kind == EntryKind::Directory { 0 } else { metadata.len() },
            modified: metadata.modified().ok(),
            kind,
            depth: entry.depth(),
            root: root.to_path_buf(),
            path,
        })
    }
}

impl Iterator for Locator {
    type Item = LocatorEvent;

    fn next(&mut self) -> Option<LocatorEvent> {
        loop {
            if self.current.is_none() && !self.open_next_root() {
                return None;
            }
            let (root, walker) = self.current.as_mut()?;
            let root = root.clone();
            match walker.next() {
                None => {
                    self.current = None;
                }
                Some(Ok(entry)) => match self.candidate(&entry, &root) {
                    Ok(candidate) => return Some(LocatorEvent::Entry(candidate)),
                    Err(warning) => {
                        tracing::debug!(path = %warning.path.display(), "{}", warning.message);
                        return Some(LocatorEvent::Warning(warning));
                    }
                },
                Some(Err(err)) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    let warning = walk_warning(&path, err);
                    tracing::debug!(path = %path.display(), "{}", warning.message);
                    return Some(LocatorEvent::Warning(warning));
                }
            }
        }
    }
}

fn walk_warning(path: &Path, err: walkdir::Error) -> ScanWarning {
    let io = err
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
    ScanWarning::from_error(path.to_path_buf(), PurgeError::io(path, io))
}

/// Total logical size of a directory tree, links not followed
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_dir())
        .map(|e| e.metadata().map(|m| m.len()).unwrap_or(0))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::catalog::RootKind;
    use tempfile::TempDir;

    fn container(path: &Path) -> SearchRoot {
        SearchRoot {
            path: path.to_path_buf(),
            kind: RootKind::Container,
        }
    }

    fn entries(locator: Locator) -> Vec<PathBuf> {
        locator
            .filter_map(|ev| match ev {
                LocatorEvent::Entry(c) => Some(c.path),
                LocatorEvent::Warning(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_container_root_is_not_emitted() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("com.foo.app")).unwrap();
        std::fs::write(tmp.path().join("com.foo.app/data.db"), b"x").unwrap();

        let found = entries(Locator::new(vec![container(tmp.path())], vec![], 4));
        assert_eq!(
            found,
            vec![tmp.path().join("com.foo.app"), tmp.path().join("com.foo.app/data.db")]
        );
    }

    #[test]
    fn test_skip_current_dir_prunes_children() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("matched")).unwrap();
        std::fs::write(tmp.path().join("matched/inner"), b"x").unwrap();

        let mut locator = Locator::new(vec![container(tmp.path())], vec![], 4);
        let mut seen = Vec::new();
        while let Some(ev) = locator.next() {
            if let LocatorEvent::Entry(c) = ev {
                if c.kind == EntryKind::Directory {
                    locator.skip_current_dir();
                }
                seen.push(c.path);
            }
        }
        assert_eq!(seen, vec![tmp.path().join("matched")]);
    }

    #[test]
    fn test_excluded_dirs_are_skipped() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("Foo/node_modules/pkg")).unwrap();

        let found = entries(Locator::new(
            vec![container(tmp.path())],
            vec!["node_modules".into()],
            4,
        ));
        assert_eq!(found, vec![tmp.path().join("Foo")]);
    }

    #[test]
    fn test_nested_root_left_to_its_own_walk() {
        let tmp = TempDir::new().unwrap();
        let prefs = tmp.path().join("Preferences");
        let by_host = prefs.join("ByHost");
        std::fs::create_dir_all(&by_host).unwrap();
        std::fs::write(by_host.join("com.foo.app.ABC.plist"), b"x").unwrap();

        let found = entries(Locator::new(vec![container(&prefs), container(&by_host)], vec![], 4));
        // ByHost is pruned from the Preferences walk and its file shows up once
        assert_eq!(found, vec![by_host.join("com.foo.app.ABC.plist")]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_outside_roots_is_a_warning() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(root.join("inside.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("escape")).unwrap();
        std::os::unix::fs::symlink(root.join("inside.txt"), root.join("local")).unwrap();

        let events: Vec<LocatorEvent> = Locator::new(vec![container(&root)], vec![], 4).collect();
        let warnings: Vec<&ScanWarning> = events
            .iter()
            .filter_map(|e| match e {
                LocatorEvent::Warning(w) => Some(w),
                _ => None,
            })
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, "symlink_escape");

        let links: Vec<&Candidate> = events
            .iter()
            .filter_map(|e| match e {
                LocatorEvent::Entry(c) if c.kind == EntryKind::Symlink => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].path, root.join("local"));
    }

    #[test]
    fn test_locator_is_restartable() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a"), b"1").unwrap();
        let roots = vec![container(tmp.path())];
        let first = entries(Locator::new(roots.clone(), vec![], 2));
        let second = entries(Locator::new(roots, vec![], 2));
        assert_eq!(first, second);
    }

    #[test]
    fn test_dir_size() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("d")).unwrap();
        std::fs::write(tmp.path().join("d/a"), vec![0u8; 100]).unwrap();
        std::fs::write(tmp.path().join("b"), vec![0u8; 50]).unwrap();
        assert_eq!(dir_size(tmp.path()), 150);
    }
}
