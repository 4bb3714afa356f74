use serde::Serialize;
use std::path::Path;
use std::process::Command;

use crate::apps::ApplicationIdentity;
use crate::common::{PurgeError, PurgeResult};

/// Suffixes of loadable code kept in `Contents/Resources`
const RESOURCE_CODE: &[&str] = &[".dylib", ".bundle", ".plugin"];

/// Library prefixes that ship with the OS
const SYSTEM_LIBRARIES: &[&str] = &["/System/", "/usr/lib/"];

/// What a bundle ships inside itself and links against
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DependencyReport {
    pub frameworks: Vec<String>,
    pub plugins: Vec<String>,
    /// Loadable code under `Contents/Resources`
    pub resources: Vec<String>,
    pub executables: Vec<String>,
    /// Non-system libraries the main executable links against
    pub shared_libraries: Vec<String>,
    /// Why shared libraries could not be listed
    pub linker_error: Option<String>,
}

impl DependencyReport {
    pub fn total(&self) -> usize {
        self.frameworks.len()
            + self.plugins.len()
            + self.resources.len()
            + self.executables.len()
            + self.shared_libraries.len()
    }
}

/// Inspect the bundle. Missing directories are simply empty; a missing
/// `otool` is recorded, not returned.
pub fn bundle_dependencies(identity: &ApplicationIdentity) -> DependencyReport {
    let contents = identity.install_path.join("Contents");
    let macos = contents.join("MacOS");

    let mut report = DependencyReport {
        frameworks: list_dir(&contents.join("Frameworks"), |n| {
            n.ends_with(".framework") || n.ends_with(".app")
        }),
        plugins: list_dir(&contents.join("PlugIns"), |_| true),
        resources: list_dir(&contents.join("Resources"), |n| {
            RESOURCE_CODE.iter().any(|suffix| n.ends_with(suffix))
        }),
        executables: list_dir(&macos, |_| true),
        ..Default::default()
    };

    let binary = identity.executable.as_deref().map(|exe| macos.join(exe));
    if let Some(binary) = binary.filter(|b| b.is_file()) {
        match linked_libraries(&binary) {
            Ok(libs) => report.shared_libraries = libs,
            Err(e) => {
                tracing::debug!(binary = %binary.display(), error = %e, "cannot list linked libraries");
                report.linker_error = Some(e.to_string());
            }
        }
    }
    report
}

fn list_dir(dir: &Path, keep: impl Fn(&str) -> bool) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| !n.starts_with('.') && keep(n))
        .collect();
    names.sort();
    names
}

/// Libraries a Mach-O binary loads, via `otool -L`
pub fn linked_libraries(binary: &Path) -> PurgeResult<Vec<String>> {
    let output = Command::new("otool")
        .arg("-L")
        .arg(binary)
        .output()
        .map_err(|e| PurgeError::io("otool", e))?;
    if !output.status.success() {
        return Err(PurgeError::Io {
            path: binary.to_path_buf(),
            source: std::io::Error::other(format!(
                "otool exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        });
    }
    Ok(parse_otool(&String::from_utf8_lossy(&output.stdout)))
}

/// First line names the binary; each following line is
/// `\t<path> (compatibility version ..., current version ...)`
fn parse_otool(stdout: &str) -> Vec<String> {
    let mut libs: Vec<String> = stdout
        .lines()
        .skip(1)
        .filter_map(|line| line.trim().split(" (").next())
        .filter(|lib| !lib.is_empty())
        .filter(|lib| !SYSTEM_LIBRARIES.iter().any(|prefix| lib.starts_with(prefix)))
        .map(str::to_string)
        .collect();
    libs.sort();
    libs.dedup();
    libs
}
