use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::apps::ApplicationIdentity;
use crate::common::config::Config;
use crate::common::permissions::SIP_PATHS;

/// Top-level system paths that must never be removed, relative to the
/// system prefix.
const PROTECTED_SYSTEM_DIRS: &[&str] = &[
    "",
    "System",
    "Applications",
    "Users",
    "Library",
    "usr",
    "bin",
    "sbin",
    "var",
    "etc",
    "opt",
    "private",
    "cores",
    "Volumes",
];

/// Paths under home that must never be removed entirely
const PROTECTED_HOME_DIRS: &[&str] = &[
    "",
    "Desktop",
    "Documents",
    "Downloads",
    "Pictures",
    "Music",
    "Movies",
    "Library",
    "Applications",
    ".ssh",
    ".gnupg",
];

/// Glob rules protected in both the user and system Library
const PROTECTED_LIBRARY_GLOBS: &[&str] = &["Keychains", "Keychains/**", "Apple", "Apple/**"];

/// Library containers searched for leftovers in the user's home
const USER_CONTAINERS: &[&str] = &[
    "Library/Application Support",
    "Library/Caches",
    "Library/Preferences",
    "Library/Preferences/ByHost",
    "Library/Saved Application State",
    "Library/Containers",
    "Library/Group Containers",
    "Library/HTTPStorages",
    "Library/WebKit",
    "Library/Cookies",
    "Library/Logs",
    "Library/Logs/DiagnosticReports",
    "Library/LaunchAgents",
];

/// System-wide containers, relative to the system prefix
const SYSTEM_CONTAINERS: &[&str] = &[
    "Library/Application Support",
    "Library/Caches",
    "Library/Preferences",
    "Library/Logs",
    "Library/Logs/DiagnosticReports",
    "Library/LaunchAgents",
    "Library/LaunchDaemons",
    "Library/PrivilegedHelperTools",
    "Library/Frameworks",
    "private/var/db/receipts",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RootKind {
    /// The application bundle itself
    Install,
    /// A Library directory shared by many applications
    Container,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchRoot {
    pub path: PathBuf,
    pub kind: RootKind,
}

impl SearchRoot {
    /// Containers are never candidates themselves, only their children
    pub fn min_depth(&self) -> usize {
        match self.kind {
            RootKind::Install => 0,
            RootKind::Container => 1,
        }
    }
}

/// A single protection predicate
#[derive(Debug, Clone)]
pub enum ProtectionRule {
    /// The path itself and every ancestor of it
    Exact(PathBuf),
    /// Everything at or below the prefix, plus its ancestors
    Prefix(PathBuf),
    Glob(glob::Pattern),
}

impl ProtectionRule {
    pub fn matches(&self, path: &Path) -> bool {
        match self {
            ProtectionRule::Exact(rule) => rule.starts_with(path),
            ProtectionRule::Prefix(prefix) => path.starts_with(prefix) || prefix.starts_with(path),
            ProtectionRule::Glob(pattern) => pattern.matches_path(path),
        }
    }
}

/// Built-in rules, caller extras and caller overrides.
///
/// Extras always protect. Overrides only lift a built-in rule when
/// `allow_overrides` is set; by default built-ins cannot be overridden.
#[derive(Debug, Clone, Default)]
pub struct ProtectionSet {
    builtin: Vec<ProtectionRule>,
    extra: Vec<ProtectionRule>,
    overrides: Vec<glob::Pattern>,
    allow_overrides: bool,
}

impl ProtectionSet {
    pub fn is_protected(&self, path: &Path) -> bool {
        if self.extra.iter().any(|rule| rule.matches(path)) {
            return true;
        }
        if !self.builtin.iter().any(|rule| rule.matches(path)) {
            return false;
        }
        !(self.allow_overrides && self.overrides.iter().any(|p| p.matches_path(path)))
    }
}

/// Search roots and protection rules for a machine.
///
/// Home and system prefix are injectable so the whole catalog can be
/// pointed at a scratch tree.
#[derive(Debug, Clone)]
pub struct PathCatalog {
    home: PathBuf,
    system_prefix: PathBuf,
    extra_protections: Vec<String>,
    overrides: Vec<String>,
    allow_overrides: bool,
    exclusions: Vec<String>,
}

impl PathCatalog {
    pub fn new(home: impl Into<PathBuf>, system_prefix: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            system_prefix: system_prefix.into(),
            extra_protections: Vec::new(),
            overrides: Vec::new(),
            allow_overrides: false,
            exclusions: Vec::new(),
        }
    }

    /// Catalog for the running user, with rules from config
    pub fn from_config(config: &Config) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/var/empty"));
        Self::new(home, "/").with_config(config)
    }

    /// Apply protection and exclusion settings from config
    pub fn with_config(mut self, config: &Config) -> Self {
        self.extra_protections = config.extra_protections.clone();
        self.overrides = config.protection_overrides.clone();
        self.allow_overrides = config.allow_protection_overrides;
        self.exclusions = config.excluded_dir_names();
        self
    }

    pub fn with_extra_protections(mut self, globs: Vec<String>) -> Self {
        self.extra_protections = globs;
        self
    }

    pub fn with_overrides(mut self, globs: Vec<String>, allow: bool) -> Self {
        self.overrides = globs;
        self.allow_overrides = allow;
        self
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn system_prefix(&self) -> &Path {
        &self.system_prefix
    }

    /// Directory names the locator never descends into
    pub fn exclusions(&self) -> &[String] {
        &self.exclusions
    }

    /// Where installed `.app` bundles are looked up by name
    pub fn app_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.system_prefix.join("Applications"),
            self.home.join("Applications"),
        ]
    }

    /// Every container directory, whether or not it exists
    pub fn container_paths(&self) -> Vec<PathBuf> {
        USER_CONTAINERS
            .iter()
            .map(|rel| self.home.join(rel))
            .chain(SYSTEM_CONTAINERS.iter().map(|rel| self.system_prefix.join(rel)))
            .collect()
    }

    /// Ordered search roots: the install path first, then existing containers
    pub fn roots(&self, identity: &ApplicationIdentity) -> Vec<SearchRoot> {
        let mut roots = Vec::new();
        if identity.install_path.exists() {
            roots.push(SearchRoot {
                path: identity.install_path.clone(),
                kind: RootKind::Install,
            });
        }
        for path in self.container_paths() {
            if path.is_dir() && !roots.iter().any(|r| r.path == path) {
                roots.push(SearchRoot {
                    path,
                    kind: RootKind::Container,
                });
            }
        }
        roots
    }

    pub fn protected_rules(&self) -> ProtectionSet {
        let mut builtin = Vec::new();

        for dir in PROTECTED_SYSTEM_DIRS {
            builtin.push(ProtectionRule::Exact(join_rel(&self.system_prefix, dir)));
        }
        for dir in PROTECTED_HOME_DIRS {
            builtin.push(ProtectionRule::Exact(join_rel(&self.home, dir)));
        }
        for sip in SIP_PATHS {
            builtin.push(ProtectionRule::Prefix(
                self.system_prefix.join(sip.trim_start_matches('/')),
            ));
        }
        for container in self.container_paths() {
            builtin.push(ProtectionRule::Exact(container));
        }
        for library in [self.home.join("Library"), self.system_prefix.join("Library")] {
            let base = glob::Pattern::escape(&library.to_string_lossy());
            for rel in PROTECTED_LIBRARY_GLOBS {
                if let Ok(pattern) = glob::Pattern::new(&format!("{}/{}", base, rel)) {
                    builtin.push(ProtectionRule::Glob(pattern));
                }
            }
        }

        let extra = self
            .extra_protections
            .iter()
            .filter_map(|g| compile_glob(g))
            .map(ProtectionRule::Glob)
            .collect();
        let overrides = self.overrides.iter().filter_map(|g| compile_glob(g)).collect();

        ProtectionSet {
            builtin,
            extra,
            overrides,
            allow_overrides: self.allow_overrides,
        }
    }
}

fn join_rel(base: &Path, rel: &str) -> PathBuf {
    if rel.is_empty() {
        base.to_path_buf()
    } else {
        base.join(rel)
    }
}

/// Compile a caller glob, expanding a leading `~`
fn compile_glob(raw: &str) -> Option<glob::Pattern> {
    let expanded = match raw.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => format!("{}/{}", home.display(), rest),
            None => raw.to_string(),
        },
        None => raw.to_string(),
    };
    match glob::Pattern::new(&expanded) {
        Ok(p) => Some(p),
        Err(e) => {
            tracing::warn!(pattern = raw, error = %e, "ignoring invalid protection glob");
            None
        }
    }
}
