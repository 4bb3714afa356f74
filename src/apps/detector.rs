use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::{PurgeError, PurgeResult};

/// Resolved identity of an installed application. Immutable for the
/// lifetime of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationIdentity {
    pub bundle_id: String,
    pub display_name: String,
    pub version: Option<String>,
    /// Canonical path of the `.app` bundle
    pub install_path: PathBuf,
    /// `CFBundleExecutable`, used to find running owners
    pub executable: Option<String>,
    /// Bundle names under `Contents/Frameworks`
    #[serde(default)]
    pub frameworks: Vec<String>,
}

impl ApplicationIdentity {
    /// Key used by the scan cache
    pub fn cache_key(&self) -> String {
        format!("{}@{}", self.bundle_id, self.install_path.display())
    }
}

/// Fields read from a bundle's Info.plist
#[derive(Debug, Default, Clone)]
pub struct BundleInfo {
    pub bundle_id: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub executable: Option<String>,
}

/// Locate the Info.plist of a bundle (`Contents/Info.plist` for apps,
/// `Info.plist` or `Resources/Info.plist` for flat bundles)
pub fn info_plist_path(bundle: &Path) -> Option<PathBuf> {
    ["Contents/Info.plist", "Info.plist", "Resources/Info.plist"]
        .iter()
        .map(|rel| bundle.join(rel))
        .find(|p| p.is_file())
}

/// Parse Info.plist; `None` if it is missing or not a dictionary
pub fn parse_info_plist(path: &Path) -> Option<BundleInfo> {
    let value = plist::Value::from_file(path).ok()?;
    let dict = value.as_dictionary()?;
    let get = |key: &str| {
        dict.get(key)
            .and_then(|v| v.as_string())
            .map(|s| s.to_string())
    };

    Some(BundleInfo {
        bundle_id: get("CFBundleIdentifier"),
        name: get("CFBundleDisplayName").or_else(|| get("CFBundleName")),
        version: get("CFBundleShortVersionString").or_else(|| get("CFBundleVersion")),
        executable: get("CFBundleExecutable"),
    })
}

/// Bundle identifier of a bundle directory, if it has one
pub fn bundle_identifier(bundle: &Path) -> Option<String> {
    info_plist_path(bundle)
        .and_then(|p| parse_info_plist(&p))
        .and_then(|info| info.bundle_id)
}

/// Build an identity from an `.app` bundle path
pub fn identity_from_bundle(app_path: &Path) -> PurgeResult<ApplicationIdentity> {
    let name = app_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| app_path.display().to_string());

    if !app_path.is_dir() {
        return Err(PurgeError::NotFound {
            query: app_path.display().to_string(),
        });
    }

    let install_path =
        std::fs::canonicalize(app_path).map_err(|e| PurgeError::io(app_path, e))?;

    let info = info_plist_path(&install_path)
        .and_then(|p| parse_info_plist(&p))
        .ok_or_else(|| PurgeError::AppError {
            name: name.clone(),
            message: "missing or unreadable Info.plist".into(),
        })?;

    let bundle_id = info.bundle_id.ok_or_else(|| PurgeError::AppError {
        name: name.clone(),
        message: "Info.plist has no CFBundleIdentifier".into(),
    })?;

    Ok(ApplicationIdentity {
        bundle_id,
        display_name: info.name.unwrap_or(name),
        version: info.version,
        frameworks: list_frameworks(&install_path),
        install_path,
        executable: info.executable,
    })
}

/// Names of the bundles shipped in `Contents/Frameworks`
fn list_frameworks(app_path: &Path) -> Vec<String> {
    let dir = app_path.join("Contents/Frameworks");
    let mut names: Vec<String> = match std::fs::read_dir(&dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| !n.starts_with('.'))
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

/// Discover all `.app` bundles in the given directories, sorted by name.
/// Bundles without a bundle identifier are skipped.
pub fn discover_apps(app_dirs: &[PathBuf]) -> Vec<ApplicationIdentity> {
    let mut apps = Vec::new();
    for dir in app_dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("app") {
                continue;
            }
            match identity_from_bundle(&path) {
                Ok(app) => apps.push(app),
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "skipping bundle"),
            }
        }
    }
    apps.sort_by(|a, b| a.display_name.to_lowercase().cmp(&b.display_name.to_lowercase()));
    apps
}

/// Resolve a bundle path, an app name or a bundle id to an identity.
///
/// Paths are used as-is; anything else is looked up among the bundles in
/// `app_dirs` by file stem, display name or bundle id (case-insensitive).
pub fn resolve(query: &str, app_dirs: &[PathBuf]) -> PurgeResult<ApplicationIdentity> {
    let as_path = Path::new(query);
    if query.contains('/') || (query.ends_with(".app") && as_path.exists()) {
        return identity_from_bundle(as_path);
    }

    let wanted = query.trim_end_matches(".app").to_lowercase();
    discover_apps(app_dirs)
        .into_iter()
        .find(|app| {
            let stem = app
                .install_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            stem == wanted
                || app.display_name.to_lowercase() == wanted
                || app.bundle_id.to_lowercase() == wanted
        })
        .ok_or_else(|| PurgeError::NotFound {
            query: query.to_string(),
        })
}
