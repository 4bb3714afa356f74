use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

use super::manifest::{sha256_file, ManifestEntry, SnapshotLabel, SnapshotManifest};
use crate::common::{PurgeError, PurgeResult};
use crate::scanner::walker::EntryKind;

pub const ARCHIVE_NAME: &str = "archive.zip";
pub const MANIFEST_NAME: &str = "manifest.json";

const READ_BUFFER: usize = 1024 * 1024;

/// Outcome of writing a snapshot back to disk
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub snapshot_id: String,
    /// Entries written back
    pub restored: usize,
    /// Entries that were already on disk with identical content
    pub already_present: usize,
    pub restored_bytes: u64,
    pub errors: Vec<RestoreFailure>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreFailure {
    pub path: PathBuf,
    pub kind: String,
    pub message: String,
}

/// An entry found while expanding the matched paths
struct Pending {
    path: PathBuf,
    kind: EntryKind,
    mode: u32,
    size_bytes: u64,
    link_target: Option<PathBuf>,
}

/// Working directory for an in-progress seal, removed on drop unless kept
struct SealDir {
    path: PathBuf,
    keep: bool,
}

impl Drop for SealDir {
    fn drop(&mut self) {
        if !self.keep {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove seal directory");
            }
        }
    }
}

/// Reader that hashes everything passing through it
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (String, u64) {
        (format!("{:x}", self.hasher.finalize()), self.bytes)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// Copy `paths` (expanding directories) into a new snapshot under `root`.
///
/// Nothing is left under `root` unless the whole snapshot was written:
/// all work happens in a hidden `.seal-*` directory that is renamed to
/// `<root>/<id>` as the last step.
pub fn seal(root: &Path, paths: &[PathBuf], label: SnapshotLabel) -> PurgeResult<SnapshotManifest> {
    fs::create_dir_all(root).map_err(|e| PurgeError::io(root, e))?;

    let pending = expand(paths)?;
    tracing::debug!(entries = pending.len(), "expanded snapshot entries");

    // Checksums first, in parallel; the archive pass re-hashes and compares
    let checksums: Vec<Option<String>> = pending
        .par_iter()
        .map(|p| match p.kind {
            EntryKind::File => sha256_file(&p.path).map(Some),
            _ => Ok(None),
        })
        .collect::<PurgeResult<_>>()?;

    let mut work = SealDir {
        path: root.join(format!(".seal-{}", uuid::Uuid::new_v4())),
        keep: false,
    };
    fs::create_dir_all(&work.path).map_err(|e| PurgeError::io(&work.path, e))?;

    let archive_path = work.path.join(ARCHIVE_NAME);
    let file = File::create(&archive_path).map_err(|e| PurgeError::io(&archive_path, e))?;
    let mut zip = zip::ZipWriter::new(file);
    let zip_err = |e: zip::result::ZipError| PurgeError::Archive {
        path: archive_path.clone(),
        message: e.to_string(),
    };

    let mut entries = Vec::with_capacity(pending.len());
    let mut file_index = 0usize;

    for (p, checksum) in pending.into_iter().zip(checksums) {
        let archive_name = match (&p.kind, &checksum) {
            (EntryKind::File, Some(expected)) => {
                file_index += 1;
                let name = format!("files/{:06}", file_index);
                let options = SimpleFileOptions::default()
                    .compression_method(CompressionMethod::Deflated)
                    .unix_permissions(p.mode & 0o7777)
                    .large_file(p.size_bytes >= u32::MAX as u64);
                zip.start_file(name.clone(), options).map_err(zip_err)?;

                let source = File::open(&p.path).map_err(|e| PurgeError::io(&p.path, e))?;
                let mut reader = HashingReader::new(BufReader::with_capacity(READ_BUFFER, source));
                std::io::copy(&mut reader, &mut zip).map_err(|e| PurgeError::io(&p.path, e))?;
                let (actual, _) = reader.finish();
                if &actual != expected {
                    return Err(PurgeError::Archive {
                        path: p.path.clone(),
                        message: "file changed while it was being sealed".into(),
                    });
                }
                Some(name)
            }
            _ => None,
        };

        entries.push(ManifestEntry {
            original_path: p.path,
            archive_path: archive_name,
            checksum,
            mode: p.mode,
            kind: p.kind,
            size_bytes: p.size_bytes,
            link_target: p.link_target,
        });
    }

    let manifest = SnapshotManifest::new(label, entries)?;
    let json = manifest.to_json()?;

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(MANIFEST_NAME, options).map_err(zip_err)?;
    zip.write_all(json.as_bytes())
        .map_err(|e| PurgeError::io(&archive_path, e))?;
    let file = zip.finish().map_err(zip_err)?;
    file.sync_all().map_err(|e| PurgeError::io(&archive_path, e))?;

    let beside = work.path.join(MANIFEST_NAME);
    fs::write(&beside, &json).map_err(|e| PurgeError::io(&beside, e))?;

    let final_dir = root.join(&manifest.id);
    if final_dir.exists() {
        // Same content was sealed before
        if let Ok(existing) = SnapshotManifest::load(&final_dir) {
            if existing.verify().is_ok() && existing.id == manifest.id {
                tracing::info!(snapshot = %existing.id, "identical snapshot already exists");
                return Ok(existing);
            }
        }
        fs::remove_dir_all(&final_dir).map_err(|e| PurgeError::io(&final_dir, e))?;
    }
    fs::rename(&work.path, &final_dir).map_err(|e| PurgeError::io(&final_dir, e))?;
    work.keep = true;

    tracing::info!(
        snapshot = %manifest.id,
        entries = manifest.entries.len(),
        bytes = manifest.total_bytes,
        "snapshot sealed"
    );
    Ok(manifest)
}

/// Walk every path and describe what has to be captured, parents first
fn expand(paths: &[PathBuf]) -> PurgeResult<Vec<Pending>> {
    let mut seen = HashSet::new();
    let mut pending = Vec::new();

    for path in paths {
        for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let at = e.path().map(Path::to_path_buf).unwrap_or_else(|| path.clone());
                match e.into_io_error() {
                    Some(io) => PurgeError::io(at, io),
                    None => PurgeError::Archive {
                        path: at,
                        message: "filesystem loop".into(),
                    },
                }
            })?;

            let entry_path = entry.path().to_path_buf();
            if !seen.insert(entry_path.clone()) {
                continue;
            }
            let meta = fs::symlink_metadata(&entry_path).map_err(|e| PurgeError::io(&entry_path, e))?;
            let file_type = meta.file_type();

            let (kind, link_target) = if file_type.is_symlink() {
                let target = fs::read_link(&entry_path).map_err(|e| PurgeError::io(&entry_path, e))?;
                (EntryKind::Symlink, Some(target))
            } else if file_type.is_dir() {
                (EntryKind::Directory, None)
            } else if file_type.is_file() {
                (EntryKind::File, None)
            } else {
                // Sockets and fifos cannot be restored meaningfully
                tracing::debug!(path = %entry_path.display(), "skipping special file");
                continue;
            };

            pending.push(Pending {
                size_bytes: if kind == EntryKind::File { meta.len() } else { 0 },
                mode: meta.permissions().mode(),
                path: entry_path,
                kind,
                link_target,
            });
        }
    }
    Ok(pending)
}

/// Write every entry of a verified snapshot back to its original location.
/// Existing paths are never overwritten. Per-entry failures are collected
/// in the report.
pub fn restore(dir: &Path, manifest: &SnapshotManifest) -> PurgeResult<RestoreReport> {
    manifest.verify()?;

    let archive_path = dir.join(ARCHIVE_NAME);
    let corrupt = |message: String| PurgeError::SnapshotCorrupt {
        snapshot_id: manifest.id.clone(),
        message,
    };
    let file = File::open(&archive_path).map_err(|e| corrupt(format!("cannot open archive: {}", e)))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupt(format!("unreadable archive: {}", e)))?;

    let mut report = RestoreReport {
        snapshot_id: manifest.id.clone(),
        ..Default::default()
    };
    // Directory modes are applied last so read-only directories can be filled
    let mut created_dirs: Vec<(PathBuf, u32)> = Vec::new();

    for entry in &manifest.entries {
        let result = match entry.kind {
            EntryKind::Directory => restore_dir(entry, &mut created_dirs),
            EntryKind::Symlink => restore_symlink(entry),
            EntryKind::File => restore_file(entry, &mut archive, &manifest.id),
        };
        match result {
            Ok(Placed::Written(bytes)) => {
                report.restored += 1;
                report.restored_bytes += bytes;
            }
            Ok(Placed::AlreadyPresent) => report.already_present += 1,
            Err(e) => {
                tracing::warn!(path = %entry.original_path.display(), error = %e, "restore failed for entry");
                report.errors.push(RestoreFailure {
                    path: entry.original_path.clone(),
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    for (path, mode) in created_dirs.iter().rev() {
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)) {
            report.errors.push(RestoreFailure {
                path: path.clone(),
                kind: "io_error".into(),
                message: e.to_string(),
            });
        }
    }

    tracing::info!(
        snapshot = %manifest.id,
        restored = report.restored,
        already_present = report.already_present,
        errors = report.errors.len(),
        "snapshot restored"
    );
    Ok(report)
}

enum Placed {
    Written(u64),
    AlreadyPresent,
}

fn exists_error(path: &Path) -> PurgeError {
    PurgeError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "a different entry already exists at this path",
        ),
    }
}

fn restore_dir(entry: &ManifestEntry, created: &mut Vec<(PathBuf, u32)>) -> PurgeResult<Placed> {
    let path = &entry.original_path;
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(Placed::AlreadyPresent),
        Ok(_) => Err(exists_error(path)),
        Err(_) => {
            fs::create_dir_all(path).map_err(|e| PurgeError::io(path, e))?;
            created.push((path.clone(), entry.mode));
            Ok(Placed::Written(0))
        }
    }
}

fn restore_symlink(entry: &ManifestEntry) -> PurgeResult<Placed> {
    let path = &entry.original_path;
    let target = entry.link_target.as_ref().ok_or_else(|| PurgeError::SnapshotCorrupt {
        snapshot_id: String::new(),
        message: format!("symlink '{}' has no target", path.display()),
    })?;

    if fs::symlink_metadata(path).is_ok() {
        return match fs::read_link(path) {
            Ok(existing) if &existing == target => Ok(Placed::AlreadyPresent),
            _ => Err(exists_error(path)),
        };
    }
    ensure_parent(path)?;
    std::os::unix::fs::symlink(target, path).map_err(|e| PurgeError::io(path, e))?;
    Ok(Placed::Written(0))
}

fn restore_file(entry: &ManifestEntry, archive: &mut zip::ZipArchive<File>, snapshot_id: &str) -> PurgeResult<Placed> {
    let path = &entry.original_path;
    let corrupt = |message: String| PurgeError::SnapshotCorrupt {
        snapshot_id: snapshot_id.to_string(),
        message,
    };
    let (Some(name), Some(expected)) = (entry.archive_path.as_deref(), entry.checksum.as_deref()) else {
        return Err(corrupt(format!("file entry '{}' has no archive member", path.display())));
    };

    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.is_file() && sha256_file(path)? == expected {
            return Ok(Placed::AlreadyPresent);
        }
        return Err(exists_error(path));
    }

    ensure_parent(path)?;
    let partial = partial_path(path);
    let written = write_member(archive, name, &partial).and_then(|(actual, bytes)| {
        if actual == expected {
            Ok(bytes)
        } else {
            Err(corrupt(format!("checksum mismatch for member {}", name)))
        }
    });
    let bytes = match written {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
    };

    fs::set_permissions(&partial, fs::Permissions::from_mode(entry.mode & 0o7777))
        .map_err(|e| PurgeError::io(&partial, e))?;
    fs::rename(&partial, path).map_err(|e| {
        let _ = fs::remove_file(&partial);
        PurgeError::io(path, e)
    })?;
    tracing::debug!(path = %path.display(), bytes, "restored file");
    Ok(Placed::Written(bytes))
}

/// Extract one archive member to `dest`, returning its checksum and length
fn write_member(archive: &mut zip::ZipArchive<File>, name: &str, dest: &Path) -> PurgeResult<(String, u64)> {
    let member = archive.by_name(name).map_err(|e| PurgeError::Archive {
        path: PathBuf::from(name),
        message: e.to_string(),
    })?;
    let mut reader = HashingReader::new(member);
    let mut out = File::create(dest).map_err(|e| PurgeError::io(dest, e))?;
    std::io::copy(&mut reader, &mut out).map_err(|e| PurgeError::io(dest, e))?;
    out.sync_all().map_err(|e| PurgeError::io(dest, e))?;
    Ok(reader.finish())
}

/// Read the copy of the manifest stored inside an archive
pub fn read_embedded_manifest(dir: &Path, snapshot_id: &str) -> PurgeResult<SnapshotManifest> {
    let archive_path = dir.join(ARCHIVE_NAME);
    let corrupt = |message: String| PurgeError::SnapshotCorrupt {
        snapshot_id: snapshot_id.to_string(),
        message,
    };
    let file = File::open(&archive_path).map_err(|e| corrupt(format!("cannot open archive: {}", e)))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;
    let mut member = archive
        .by_name(MANIFEST_NAME)
        .map_err(|e| corrupt(format!("archive has no manifest: {}", e)))?;
    let mut json = String::new();
    member
        .read_to_string(&mut json)
        .map_err(|e| corrupt(format!("cannot read manifest: {}", e)))?;
    SnapshotManifest::from_json(snapshot_id, &json)
}

fn ensure_parent(path: &Path) -> PurgeResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| PurgeError::io(parent, e))
        }
        _ => Ok(()),
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.fspurge-partial", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::manifest::sha256_reader;
    use tempfile::TempDir;

    fn checksum_of(bytes: &[u8]) -> String {
        sha256_reader(&mut &bytes[..]).unwrap()
    }

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("data/com.foo.app");
        fs::create_dir_all(data.join("nested")).unwrap();
        fs::write(data.join("a.txt"), b"alpha").unwrap();
        fs::write(data.join("nested/b.bin"), vec![7u8; 4096]).unwrap();
        fs::set_permissions(data.join("a.txt"), fs::Permissions::from_mode(0o640)).unwrap();
        std::os::unix::fs::symlink("a.txt", data.join("link")).unwrap();
        let snapshots = tmp.path().join("snapshots");
        (tmp, data, snapshots)
    }

    #[test]
    fn test_seal_records_every_entry() {
        let (_tmp, data, snapshots) = setup();
        let manifest = seal(&snapshots, &[data.clone()], SnapshotLabel::default()).unwrap();

        assert_eq!(manifest.file_count(), 2);
        assert_eq!(manifest.total_bytes, 5 + 4096);
        let a = manifest
            .entries
            .iter()
            .find(|e| e.original_path.ends_with("a.txt"))
            .unwrap();
        assert_eq!(a.checksum.as_deref(), Some(checksum_of(b"alpha").as_str()));
        assert_eq!(a.mode & 0o777, 0o640);
        let link = manifest.entries.iter().find(|e| e.kind == EntryKind::Symlink).unwrap();
        assert_eq!(link.link_target.as_deref(), Some(Path::new("a.txt")));

        let dir = snapshots.join(&manifest.id);
        assert!(dir.join(ARCHIVE_NAME).is_file());
        assert!(dir.join(MANIFEST_NAME).is_file());
        assert_eq!(read_embedded_manifest(&dir, &manifest.id).unwrap(), manifest);
    }

    #[test]
    fn test_failed_seal_leaves_nothing_behind() {
        let (tmp, data, snapshots) = setup();
        let missing = tmp.path().join("gone");
        let result = seal(&snapshots, &[data, missing], SnapshotLabel::default());

        assert!(result.is_err());
        assert_eq!(fs::read_dir(&snapshots).unwrap().count(), 0);
    }

    #[test]
    fn test_restore_round_trip() {
        let (_tmp, data, snapshots) = setup();
        let manifest = seal(&snapshots, &[data.clone()], SnapshotLabel::default()).unwrap();
        fs::remove_dir_all(&data).unwrap();

        let report = restore(&snapshots.join(&manifest.id), &manifest).unwrap();
        assert!(report.is_complete(), "{:?}", report.errors);
        assert_eq!(fs::read(data.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(data.join("nested/b.bin")).unwrap(), vec![7u8; 4096]);
        let mode = fs::metadata(data.join("a.txt")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
        assert_eq!(fs::read_link(data.join("link")).unwrap(), PathBuf::from("a.txt"));
    }

    #[test]
    fn test_restore_never_overwrites() {
        let (_tmp, data, snapshots) = setup();
        let manifest = seal(&snapshots, &[data.clone()], SnapshotLabel::default()).unwrap();
        fs::write(data.join("a.txt"), b"changed").unwrap();
        fs::remove_file(data.join("nested/b.bin")).unwrap();

        let report = restore(&snapshots.join(&manifest.id), &manifest).unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].path.ends_with("a.txt"));
        assert_eq!(fs::read(data.join("a.txt")).unwrap(), b"changed");
        assert!(data.join("nested/b.bin").exists());
        // data dir, nested dir and the symlink were untouched
        assert_eq!(report.already_present, 3);
    }

    #[test]
    fn test_restore_rejects_tampered_manifest() {
        let (_tmp, data, snapshots) = setup();
        let mut manifest = seal(&snapshots, &[data], SnapshotLabel::default()).unwrap();
        manifest.entries.pop();
        let err = restore(&snapshots.join(&manifest.id), &manifest).unwrap_err();
        assert_eq!(err.kind(), "snapshot_corrupt");
    }
}
