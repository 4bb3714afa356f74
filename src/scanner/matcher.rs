use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use super::walker::{Candidate, EntryKind};
use crate::apps::detector;
use crate::apps::ApplicationIdentity;
use crate::processes::system::is_launchd_plist;

/// Name similarity below this never counts as a match
pub const FUZZY_THRESHOLD: f64 = 0.6;

/// Plists larger than this are not opened for metadata
const MAX_PLIST_BYTES: u64 = 1024 * 1024;

/// Suffixes stripped before comparing a name with the bundle id
const ID_SUFFIXES: &[&str] = &[".plist", ".savedState", ".binarycookies", ".app"];

/// Matching strategies, in priority order. The first one that fires
/// decides the confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Identifier,
    PathHeuristic,
    NameFuzzy,
    Metadata,
}

impl Strategy {
    pub const PRIORITY: [Strategy; 4] = [
        Strategy::Identifier,
        Strategy::PathHeuristic,
        Strategy::NameFuzzy,
        Strategy::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Identifier => "identifier",
            Strategy::PathHeuristic => "path_heuristic",
            Strategy::NameFuzzy => "name_fuzzy",
            Strategy::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Score {
    pub confidence: f64,
    pub matched_by: BTreeSet<Strategy>,
}

impl Score {
    pub fn is_match(&self) -> bool {
        !self.matched_by.is_empty()
    }
}

/// Metadata read from the entry itself (bundle Info.plist or plist body)
#[derive(Debug, Default)]
struct EntryMetadata {
    identifiers: Vec<String>,
    strings: Vec<String>,
}

impl EntryMetadata {
    fn load(candidate: &Candidate) -> Self {
        match candidate.kind {
            EntryKind::Directory => Self {
                identifiers: detector::bundle_identifier(&candidate.path).into_iter().collect(),
                strings: Vec::new(),
            },
            EntryKind::File if is_plist(&candidate.path) && candidate.size_bytes <= MAX_PLIST_BYTES => {
                Self::from_plist(&candidate.path)
            }
            _ => Self::default(),
        }
    }

    fn from_plist(path: &Path) -> Self {
        let Ok(value) = plist::Value::from_file(path) else {
            return Self::default();
        };
        let mut meta = Self::default();
        if let Some(dict) = value.as_dictionary() {
            for key in ["Label", "CFBundleIdentifier"] {
                if let Some(id) = dict.get(key).and_then(|v| v.as_string()) {
                    meta.identifiers.push(id.to_string());
                }
            }
        }
        collect_strings(&value, &mut meta.strings);
        meta
    }
}

fn is_plist(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("plist")
}

fn collect_strings(value: &plist::Value, out: &mut Vec<String>) {
    match value {
        plist::Value::String(s) => out.push(s.clone()),
        plist::Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        plist::Value::Dictionary(dict) => dict.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Score a candidate against an application.
///
/// Every strategy is evaluated and recorded in `matched_by`; the first
/// one in [`Strategy::PRIORITY`] order fixes the confidence. Pure apart
/// from reading the entry's own metadata, so repeated calls agree.
pub fn score(candidate: &Candidate, identity: &ApplicationIdentity) -> Score {
    let name = candidate.file_name();
    let meta = EntryMetadata::load(candidate);

    let mut fired: Vec<(Strategy, f64)> = Vec::new();
    for strategy in Strategy::PRIORITY {
        let confidence = match strategy {
            Strategy::Identifier => identifier(&name, &meta, &identity.bundle_id),
            Strategy::PathHeuristic => candidate
                .path
                .starts_with(&identity.install_path)
                .then_some(0.9),
            Strategy::NameFuzzy => name_fuzzy(&name, identity),
            Strategy::Metadata => metadata(candidate, &name, &meta, identity),
        };
        if let Some(c) = confidence {
            fired.push((strategy, c));
        }
    }

    Score {
        confidence: fired.first().map(|(_, c)| *c).unwrap_or(0.0),
        matched_by: fired.into_iter().map(|(s, _)| s).collect(),
    }
}

fn identifier(name: &str, meta: &EntryMetadata, bundle_id: &str) -> Option<f64> {
    let id = bundle_id.to_lowercase();
    let lower = name.to_lowercase();

    let stem = ID_SUFFIXES
        .iter()
        .find_map(|suffix| lower.strip_suffix(&suffix.to_lowercase()))
        .unwrap_or(&lower);

    let dotted = format!(".{}", id);
    let by_name = [lower.as_str(), stem].iter().any(|n| {
        // group containers and team-prefixed ids: "group.<id>", "ABCDE12345.<id>"
        *n == id || n.ends_with(&dotted)
    }) || lower.starts_with(&format!("{}.", id));
    let by_meta = meta.identifiers.iter().any(|m| m.to_lowercase() == id);

    (by_name || by_meta).then_some(1.0)
}

fn name_fuzzy(name: &str, identity: &ApplicationIdentity) -> Option<f64> {
    let sim = [Some(identity.display_name.as_str()), identity.executable.as_deref()]
        .into_iter()
        .flatten()
        .map(|app_name| similarity(name_stem(name), app_name))
        .fold(0.0_f64, f64::max);

    (sim >= FUZZY_THRESHOLD).then(|| 0.6 + 0.25 * (sim - FUZZY_THRESHOLD) / (1.0 - FUZZY_THRESHOLD))
}

/// Auxiliary hints. Both are narrow on purpose: system plists such as the
/// Dock's list every installed app, and frameworks like Sparkle are
/// shared between vendors.
fn metadata(candidate: &Candidate, name: &str, meta: &EntryMetadata, identity: &ApplicationIdentity) -> Option<f64> {
    // A bundled framework only counts when it carries the app's vendor prefix
    let vendor = vendor_prefix(&identity.bundle_id);
    let is_framework = identity.frameworks.iter().any(|f| f == name)
        && vendor.is_some()
        && meta.identifiers.iter().any(|id| vendor_prefix(id) == vendor);

    // Only a launchd job can point into the bundle and still belong to it
    let install = identity.install_path.to_string_lossy();
    let references_install = is_launchd_plist(&candidate.path)
        && !install.is_empty()
        && meta.strings.iter().any(|s| s.contains(install.as_ref()));

    (is_framework || references_install).then_some(0.4)
}

/// `com.acme` for `com.acme.Widget`; ids with fewer than three parts have none
fn vendor_prefix(bundle_id: &str) -> Option<String> {
    let parts: Vec<&str> = bundle_id.split('.').collect();
    (parts.len() >= 3).then(|| format!("{}.{}", parts[0], parts[1]).to_lowercase())
}

/// Entry name without its final extension
fn name_stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

fn compact(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn tokens(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in s.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        // camelCase boundary
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn bigrams(s: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Normalized name similarity in [0, 1].
///
/// Sørensen–Dice over character bigrams of the compacted, lowercased
/// names. A candidate whose tokens contain every token of the app name
/// (app name at least 3 chars) scores at least 0.7.
pub fn similarity(candidate: &str, app_name: &str) -> f64 {
    let a = compact(candidate);
    let b = compact(app_name);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let dice = {
        let left = bigrams(&a);
        let mut right = bigrams(&b);
        if left.is_empty() || right.is_empty() {
            0.0
        } else {
            let total = left.len() + right.len();
            let mut shared = 0usize;
            for gram in &left {
                if let Some(pos) = right.iter().position(|g| g == gram) {
                    right.swap_remove(pos);
                    shared += 1;
                }
            }
            2.0 * shared as f64 / total as f64
        }
    };

    let app_tokens = tokens(app_name);
    let cand_tokens = tokens(candidate);
    let contained = b.chars().count() >= 3
        && !app_tokens.is_empty()
        && app_tokens.iter().all(|t| cand_tokens.contains(t));

    if contained {
        dice.max(0.7)
    } else {
        dice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn foo() -> ApplicationIdentity {
        ApplicationIdentity {
            bundle_id: "com.foo.app".into(),
            display_name: "Foo".into(),
            version: None,
            install_path: PathBuf::from("/Applications/Foo.app"),
            executable: Some("Foo".into()),
            frameworks: vec!["FooKit.framework".into()],
        }
    }

    fn file(path: &str) -> Candidate {
        Candidate {
            path: PathBuf::from(path),
            size_bytes: 1,
            modified: None,
            kind: EntryKind::File,
            depth: 1,
            root: PathBuf::from("/"),
        }
    }

    #[test]
    fn test_identifier_wins_over_other_strategies() {
        let s = score(&file("/Users/a/Library/Preferences/com.foo.app.plist"), &foo());
        assert_eq!(s.confidence, 1.0);
        assert!(s.matched_by.contains(&Strategy::Identifier));
    }

    #[test]
    fn test_identifier_does_not_match_longer_ids() {
        let s = score(&file("/Users/a/Library/Caches/com.foo.application"), &foo());
        assert!(!s.matched_by.contains(&Strategy::Identifier));
    }

    #[test]
    fn test_group_container_is_identifier() {
        let s = score(&file("/Users/a/Library/Group Containers/ABCDE12345.com.foo.app"), &foo());
        assert_eq!(s.confidence, 1.0);
    }

    #[test]
    fn test_path_heuristic() {
        let s = score(&file("/Applications/Foo.app/Contents/Resources/x.bin"), &foo());
        assert_eq!(s.confidence, 0.9);
        assert_eq!(s.matched_by, BTreeSet::from([Strategy::PathHeuristic]));
    }

    #[test]
    fn test_fuzzy_name_is_scaled() {
        let s = score(&file("/Users/a/Library/Application Support/Foo"), &foo());
        assert_eq!(s.matched_by, BTreeSet::from([Strategy::NameFuzzy]));
        assert!((s.confidence - 0.85).abs() < 1e-9);

        let partial = score(&file("/Library/LaunchDaemons/com.apple.foo.plist"), &foo());
        assert!(partial.confidence >= 0.6 && partial.confidence < 0.85);
    }

    #[test]
    fn test_unrelated_entry_does_not_match() {
        let s = score(&file("/Users/a/Library/Caches/com.other.tool"), &foo());
        assert!(!s.is_match());
        assert_eq!(s.confidence, 0.0);
    }

    fn framework(root: &Path, name: &str, bundle_id: &str) -> Candidate {
        let path = root.join(name);
        std::fs::create_dir_all(path.join("Resources")).unwrap();
        let mut dict = plist::Dictionary::new();
        dict.insert("CFBundleIdentifier".into(), plist::Value::String(bundle_id.into()));
        plist::Value::Dictionary(dict)
            .to_file_xml(path.join("Resources/Info.plist"))
            .unwrap();
        Candidate {
            kind: EntryKind::Directory,
            ..file(path.to_str().unwrap())
        }
    }

    #[test]
    fn test_vendor_framework_is_metadata() {
        let tmp = TempDir::new().unwrap();
        let s = score(&framework(tmp.path(), "FooKit.framework", "com.foo.FooKit"), &foo());
        assert!(s.matched_by.contains(&Strategy::Metadata));
        assert!(!s.matched_by.contains(&Strategy::Identifier));
    }

    #[test]
    fn test_shared_framework_is_not_claimed() {
        let tmp = TempDir::new().unwrap();
        let mut app = foo();
        app.frameworks.push("Sparkle.framework".into());
        let s = score(&framework(tmp.path(), "Sparkle.framework", "org.sparkle-project.Sparkle"), &app);
        assert!(!s.is_match());
    }

    #[test]
    fn test_plist_label_and_program_reference() {
        let tmp = TempDir::new().unwrap();
        let agents = tmp.path().join("LaunchAgents");
        std::fs::create_dir_all(&agents).unwrap();
        let by_label = tmp.path().join("helper.plist");
        let mut dict = plist::Dictionary::new();
        dict.insert("Label".into(), plist::Value::String("com.foo.app".into()));
        plist::Value::Dictionary(dict).to_file_xml(&by_label).unwrap();

        let by_program = agents.join("agent.plist");
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "ProgramArguments".into(),
            plist::Value::Array(vec![plist::Value::String(
                "/Applications/Foo.app/Contents/MacOS/agent".into(),
            )]),
        );
        plist::Value::Dictionary(dict).to_file_xml(&by_program).unwrap();

        let mut c = file(by_label.to_str().unwrap());
        c.size_bytes = std::fs::metadata(&by_label).unwrap().len();
        assert_eq!(score(&c, &foo()).confidence, 1.0);

        let mut c = file(by_program.to_str().unwrap());
        c.size_bytes = std::fs::metadata(&by_program).unwrap().len();
        let s = score(&c, &foo());
        assert_eq!(s.confidence, 0.4);
        assert_eq!(s.matched_by, BTreeSet::from([Strategy::Metadata]));
    }

    #[test]
    fn test_system_plist_listing_the_app_is_not_a_match() {
        let tmp = TempDir::new().unwrap();
        let dock = tmp.path().join("com.apple.dock.plist");
        let mut tile = plist::Dictionary::new();
        tile.insert(
            "_CFURLString".into(),
            plist::Value::String("file:///Applications/Foo.app/".into()),
        );
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "persistent-apps".into(),
            plist::Value::Array(vec![plist::Value::Dictionary(tile)]),
        );
        plist::Value::Dictionary(dict).to_file_xml(&dock).unwrap();

        let mut c = file(dock.to_str().unwrap());
        c.size_bytes = std::fs::metadata(&dock).unwrap().len();
        assert!(!score(&c, &foo()).is_match());
    }

    #[test]
    fn test_scoring_is_idempotent() {
        let c = file("/Users/a/Library/Logs/Foo Helper");
        assert_eq!(score(&c, &foo()), score(&c, &foo()));
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("Foo", "foo"), 1.0);
        assert_eq!(similarity("", "foo"), 0.0);
        assert!(similarity("Foo Helper", "Foo") >= 0.7);
        assert!(similarity("Xyz", "Foo") < FUZZY_THRESHOLD);
    }
}
