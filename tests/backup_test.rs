use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use fspurge::backup::{BackupManager, SnapshotLabel};
use fspurge::scanner::walker::EntryKind;
use fspurge::scanner::FileMatch;

fn leftover(path: &Path) -> FileMatch {
    let meta = fs::symlink_metadata(path).unwrap();
    FileMatch {
        path: path.to_path_buf(),
        size_bytes: meta.len(),
        modified: None,
        kind: if meta.is_dir() { EntryKind::Directory } else { EntryKind::File },
        matched_by: BTreeSet::new(),
        confidence: 1.0,
        protected: false,
    }
}

fn label() -> SnapshotLabel {
    SnapshotLabel {
        bundle_id: "com.foo.app".into(),
        app_name: "Foo".into(),
        mode: "standard".into(),
    }
}

/// An app-support tree with nested dirs, an executable and a symlink
fn support_tree(root: &Path) -> PathBuf {
    let support = root.join("Application Support/Foo");
    fs::create_dir_all(support.join("db/wal")).unwrap();
    fs::write(support.join("db/main.sqlite"), vec![3u8; 10_000]).unwrap();
    fs::write(support.join("db/wal/0001"), b"wal").unwrap();
    fs::write(support.join("helper"), b"#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(support.join("helper"), fs::Permissions::from_mode(0o755)).unwrap();
    std::os::unix::fs::symlink("db/main.sqlite", support.join("current")).unwrap();
    support
}

// ─── Seal & restore ───────────────────────────────────────────────────────────

#[test]
fn test_snapshot_restores_tree_after_removal() {
    let tmp = TempDir::new().unwrap();
    let support = support_tree(tmp.path());
    let prefs = tmp.path().join("com.foo.app.plist");
    fs::write(&prefs, b"<plist/>").unwrap();

    let manager = BackupManager::new(tmp.path().join("snapshots"));
    let snapshot = manager
        .seal(&[leftover(&support), leftover(&prefs)], label())
        .unwrap();
    assert_eq!(snapshot.manifest.file_count(), 4);
    assert_eq!(snapshot.manifest.total_bytes, 10_000 + 3 + 17 + 8);

    fs::remove_dir_all(&support).unwrap();
    fs::remove_file(&prefs).unwrap();

    let report = manager.restore(snapshot.id()).unwrap();
    assert!(report.is_complete(), "{:?}", report.errors);
    assert_eq!(report.already_present, 0);
    assert_eq!(fs::read(support.join("db/main.sqlite")).unwrap(), vec![3u8; 10_000]);
    assert_eq!(fs::read(&prefs).unwrap(), b"<plist/>");
    let mode = fs::metadata(support.join("helper")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
    assert_eq!(
        fs::read_link(support.join("current")).unwrap(),
        PathBuf::from("db/main.sqlite")
    );
}

#[test]
fn test_restore_never_overwrites_a_changed_file() {
    let tmp = TempDir::new().unwrap();
    let support = support_tree(tmp.path());
    let manager = BackupManager::new(tmp.path().join("snapshots"));
    let snapshot = manager.seal(&[leftover(&support)], label()).unwrap();

    fs::write(support.join("db/wal/0001"), b"newer data").unwrap();
    fs::remove_file(support.join("helper")).unwrap();

    let report = manager.restore(snapshot.id()).unwrap();
    assert_eq!(report.restored, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].path, support.join("db/wal/0001"));
    assert_eq!(fs::read(support.join("db/wal/0001")).unwrap(), b"newer data");
    assert!(support.join("helper").exists());
}

#[test]
fn test_identical_content_seals_to_the_same_id() {
    let tmp = TempDir::new().unwrap();
    let support = support_tree(tmp.path());
    let manager = BackupManager::new(tmp.path().join("snapshots"));

    let first = manager.seal(&[leftover(&support)], label()).unwrap();
    let second = manager.seal(&[leftover(&support)], label()).unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(manager.list().unwrap().len(), 1);
}

#[test]
fn test_missing_source_leaves_no_snapshot_behind() {
    let tmp = TempDir::new().unwrap();
    let support = support_tree(tmp.path());
    let mut gone = leftover(&support);
    gone.path = tmp.path().join("vanished");

    let manager = BackupManager::new(tmp.path().join("snapshots"));
    assert!(manager.seal(&[leftover(&support), gone], label()).is_err());

    let remaining: Vec<_> = fs::read_dir(manager.root())
        .map(|rd| rd.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(remaining.is_empty());
}

// ─── Purge ────────────────────────────────────────────────────────────────────

#[test]
fn test_purge_all_frees_every_snapshot() {
    let tmp = TempDir::new().unwrap();
    let support = support_tree(tmp.path());
    let other = tmp.path().join("other");
    fs::create_dir_all(&other).unwrap();
    fs::write(other.join("f"), b"x").unwrap();

    let manager = BackupManager::new(tmp.path().join("snapshots"));
    manager.seal(&[leftover(&support)], label()).unwrap();
    manager.seal(&[leftover(&other)], label()).unwrap();

    let report = manager.purge_all().unwrap();
    assert_eq!(report.purged.len(), 2);
    assert!(report.total_bytes_freed > 0);
    assert!(manager.list().unwrap().is_empty());
}

#[test]
fn test_purge_expired_keeps_fresh_snapshots() {
    let tmp = TempDir::new().unwrap();
    let support = support_tree(tmp.path());
    let manager = BackupManager::new(tmp.path().join("snapshots"));
    manager.seal(&[leftover(&support)], label()).unwrap();

    let report = manager.purge_expired(30).unwrap();
    assert!(report.purged.is_empty());
    assert_eq!(manager.list().unwrap().len(), 1);
}
