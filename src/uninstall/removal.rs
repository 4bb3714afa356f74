use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use walkdir::WalkDir;

use crate::common::{PurgeError, PurgeResult};
use crate::processes::system::is_launchd_plist;
use crate::processes::ProcessManager;
use crate::scanner::catalog::ProtectionSet;
use crate::scanner::FileMatch;

/// Delay before each retry of a busy entry
const BACKOFF_MS: [u64; 3] = [50, 100, 200];

// errno values shared by Linux and macOS
const EBUSY: i32 = 16;
const ETXTBSY: i32 = 26;

/// Deletes removable entries one at a time
pub struct Remover<'a> {
    protection: &'a ProtectionSet,
    processes: &'a ProcessManager,
    attempts: u32,
    force: bool,
    unload_services: bool,
}

impl<'a> Remover<'a> {
    pub fn new(protection: &'a ProtectionSet, processes: &'a ProcessManager, attempts: u32) -> Self {
        Self {
            protection,
            processes,
            attempts: attempts.max(1),
            force: false,
            unload_services: false,
        }
    }

    /// Break locks and clear read-only bits when plain removal fails
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Unload launchd jobs before their plists are removed
    pub fn unload_services(mut self, unload: bool) -> Self {
        self.unload_services = unload;
        self
    }

    /// Remove one entry. Returns the bytes freed; an entry that is
    /// already gone frees nothing.
    pub fn remove(&self, entry: &FileMatch) -> PurgeResult<u64> {
        let path = entry.path.as_path();
        if entry.protected || self.protection.is_protected(path) {
            tracing::error!(path = %path.display(), "protected path reached removal");
            return Err(PurgeError::ProtectedPath {
                path: path.to_path_buf(),
            });
        }

        if fs::symlink_metadata(path).is_err() {
            tracing::debug!(path = %path.display(), "already gone");
            return Ok(0);
        }

        if self.unload_services && is_launchd_plist(path) {
            if let Err(e) = self.processes.control().unload_service(path) {
                tracing::warn!(path = %path.display(), error = %e, "could not unload launchd job");
            }
        }

        match self.remove_with_retry(path) {
            Ok(()) => Ok(entry.size_bytes),
            Err(e) if self.force => {
                tracing::warn!(path = %path.display(), error = %e, "removal failed, forcing");
                self.force_remove(path, e)?;
                Ok(entry.size_bytes)
            }
            Err(e) => Err(e),
        }
    }

    fn remove_with_retry(&self, path: &Path) -> PurgeResult<()> {
        retry_busy(path, self.attempts, || delete(path))
    }

    /// Last resort: kill lock holders, make the tree writable, try again
    fn force_remove(&self, path: &Path, original: PurgeError) -> PurgeResult<()> {
        match original {
            PurgeError::LockedFile { .. } => {
                let killed = self.processes.break_lock(path);
                tracing::warn!(path = %path.display(), killed = killed.len(), "broke file locks");
            }
            PurgeError::PermissionDenied { .. } => make_writable(path),
            _ => return Err(original),
        }
        retry_busy(path, self.attempts, || delete(path))
    }
}

/// Run `op` until it stops failing with a busy error, sleeping between
/// attempts. Other errors are returned at once.
fn retry_busy(path: &Path, attempts: u32, mut op: impl FnMut() -> io::Result<()>) -> PurgeResult<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(()) => return Ok(()),
            Err(e) if is_busy(&e) => {
                if attempt >= attempts {
                    return Err(PurgeError::LockedFile {
                        path: path.to_path_buf(),
                        attempts: attempt,
                    });
                }
                let delay = BACKOFF_MS[(attempt as usize - 1).min(BACKOFF_MS.len() - 1)];
                tracing::debug!(path = %path.display(), attempt, delay_ms = delay, "entry busy, retrying");
                std::thread::sleep(Duration::from_millis(delay));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(PurgeError::io(path, e)),
        }
    }
}

fn is_busy(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(EBUSY) | Some(ETXTBSY))
}

fn delete(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Add owner write (and search, for directories) to the entry and
/// everything below it. The parent is left alone: it is usually a shared
/// container such as `~/Library/Caches`.
fn make_writable(path: &Path) {
    let targets = WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.path_is_symlink())
        .map(|e| e.into_path());

    for target in targets {
        let Ok(meta) = fs::metadata(&target) else { continue };
        let extra = if meta.is_dir() { 0o700 } else { 0o200 };
        let mode = meta.permissions().mode() | extra;
        if let Err(e) = fs::set_permissions(&target, fs::Permissions::from_mode(mode)) {
            tracing::debug!(path = %target.display(), error = %e, "chmod failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processes::manager::tests::FakeProcesses;
    use crate::scanner::catalog::PathCatalog;
    use crate::scanner::walker::EntryKind;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn entry(path: &Path, size: u64, kind: EntryKind) -> FileMatch {
        FileMatch {
            path: path.to_path_buf(),
            size_bytes: size,
            modified: None,
            kind,
            matched_by: BTreeSet::new(),
            confidence: 1.0,
            protected: false,
        }
    }

    fn manager(fake: FakeProcesses) -> (Arc<FakeProcesses>, ProcessManager) {
        let fake = Arc::new(fake);
        let pm = ProcessManager::new(fake.clone(), Duration::from_millis(1));
        (fake, pm)
    }

    #[test]
    fn test_removes_files_and_directories() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("home/Library/Caches/com.foo.app");
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("sub/x"), b"12345").unwrap();
        let file = tmp.path().join("home/Library/Preferences/com.foo.app.plist");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"<plist/>").unwrap();

        let protection = PathCatalog::new(tmp.path().join("home"), tmp.path()).protected_rules();
        let (_, pm) = manager(FakeProcesses::default());
        let remover = Remover::new(&protection, &pm, 3);

        assert_eq!(remover.remove(&entry(&dir, 5, EntryKind::Directory)).unwrap(), 5);
        assert_eq!(remover.remove(&entry(&file, 8, EntryKind::File)).unwrap(), 8);
        assert!(!dir.exists());
        assert!(!file.exists());
        // second pass is a no-op
        assert_eq!(remover.remove(&entry(&file, 8, EntryKind::File)).unwrap(), 0);
    }

    #[test]
    fn test_protected_path_is_refused() {
        let tmp = tempfile::TempDir::new().unwrap();
        let home = tmp.path().join("home");
        let library = home.join("Library");
        fs::create_dir_all(&library).unwrap();

        let protection = PathCatalog::new(&home, tmp.path()).protected_rules();
        let (_, pm) = manager(FakeProcesses::default());
        let remover = Remover::new(&protection, &pm, 3).force(true);

        let err = remover.remove(&entry(&library, 0, EntryKind::Directory)).unwrap_err();
        assert_eq!(err.kind(), "protected_path");
        assert!(library.exists());
    }

    #[test]
    fn test_launchd_plist_is_unloaded_first() {
        let tmp = tempfile::TempDir::new().unwrap();
        let plist = tmp.path().join("home/Library/LaunchAgents/com.foo.app.agent.plist");
        fs::create_dir_all(plist.parent().unwrap()).unwrap();
        fs::write(&plist, b"<plist/>").unwrap();

        let protection = PathCatalog::new(tmp.path().join("home"), tmp.path()).protected_rules();
        let (fake, pm) = manager(FakeProcesses::default());
        let remover = Remover::new(&protection, &pm, 3).unload_services(true);

        remover.remove(&entry(&plist, 8, EntryKind::File)).unwrap();
        assert_eq!(fake.unloaded.lock().unwrap().as_slice(), &[plist.clone()]);
        assert!(!plist.exists());
    }

    #[test]
    fn test_make_writable_stays_inside_the_entry() {
        let tmp = tempfile::TempDir::new().unwrap();
        let caches = tmp.path().join("Caches");
        let entry = caches.join("com.foo.app");
        fs::create_dir_all(entry.join("db")).unwrap();
        fs::write(entry.join("db/blob"), b"x").unwrap();
        fs::set_permissions(entry.join("db/blob"), fs::Permissions::from_mode(0o400)).unwrap();
        fs::set_permissions(entry.join("db"), fs::Permissions::from_mode(0o500)).unwrap();
        fs::set_permissions(&caches, fs::Permissions::from_mode(0o755)).unwrap();

        make_writable(&entry);

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&entry.join("db")), 0o700);
        assert_eq!(mode(&entry.join("db/blob")), 0o600);
        assert_eq!(mode(&caches), 0o755);
    }

    #[test]
    fn test_force_removes_read_only_tree() {
        let tmp = tempfile::TempDir::new().unwrap();
        let home = tmp.path().join("home");
        let entry_dir = home.join("Library/Caches/com.foo.app");
        fs::create_dir_all(entry_dir.join("db")).unwrap();
        fs::write(entry_dir.join("db/blob"), b"12345").unwrap();
        fs::set_permissions(entry_dir.join("db"), fs::Permissions::from_mode(0o500)).unwrap();

        let protection = PathCatalog::new(&home, tmp.path()).protected_rules();
        let (_, pm) = manager(FakeProcesses::default());
        let remover = Remover::new(&protection, &pm, 1).force(true);

        assert_eq!(remover.remove(&entry(&entry_dir, 5, EntryKind::Directory)).unwrap(), 5);
        assert!(!entry_dir.exists());
    }

    #[test]
    fn test_busy_entry_is_retried_then_reported_locked() {
        let path = Path::new("/tmp/busy");
        let mut calls = 0;
        let err = retry_busy(path, 3, || {
            calls += 1;
            Err(io::Error::from_raw_os_error(EBUSY))
        })
        .unwrap_err();
        assert_eq!(calls, 3);
        assert!(matches!(err, PurgeError::LockedFile { attempts: 3, .. }));
    }

    #[test]
    fn test_busy_entry_recovers() {
        let mut calls = 0;
        retry_busy(Path::new("/tmp/busy"), 3, || {
            calls += 1;
            if calls < 2 {
                Err(io::Error::from_raw_os_error(ETXTBSY))
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let mut calls = 0;
        let err = retry_busy(Path::new("/tmp/x"), 3, || {
            calls += 1;
            Err(io::Error::other("boom"))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(err.kind(), "io_error");
    }
}
