use serde::Serialize;

use super::catalog::ProtectionSet;
use super::FileMatch;

/// Verdicts for a candidate set
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Classification {
    pub removable: Vec<FileMatch>,
    pub protected: Vec<FileMatch>,
    /// Below the mode threshold; surfaced for a manual decision, never
    /// removed automatically
    pub ambiguous: Vec<FileMatch>,
}

impl Classification {
    pub fn removable_bytes(&self) -> u64 {
        self.removable.iter().map(|m| m.size_bytes).sum()
    }

    pub fn total(&self) -> usize {
        self.removable.len() + self.protected.len() + self.ambiguous.len()
    }
}

/// Split matches into removable, protected and ambiguous.
///
/// Protection is checked first and ignores confidence entirely.
pub fn classify(matches: &[FileMatch], protection: &ProtectionSet, threshold: f64) -> Classification {
    let mut out = Classification::default();
    for m in matches {
        let mut m = m.clone();
        if protection.is_protected(&m.path) {
            m.protected = true;
            out.protected.push(m);
        } else if m.confidence >= threshold {
            m.protected = false;
            out.removable.push(m);
        } else {
            m.protected = false;
            out.ambiguous.push(m);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::catalog::PathCatalog;
    use crate::scanner::matcher::Strategy;
    use crate::scanner::walker::EntryKind;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn m(path: &str, confidence: f64, strategy: Strategy) -> FileMatch {
        FileMatch {
            path: PathBuf::from(path),
            size_bytes: 100,
            modified: None,
            kind: EntryKind::File,
            matched_by: BTreeSet::from([strategy]),
            confidence,
            protected: false,
        }
    }

    fn rules() -> ProtectionSet {
        PathCatalog::new("/Users/alice", "/").protected_rules()
    }

    #[test]
    fn test_fuzzy_launch_daemon_is_ambiguous_in_quick_mode() {
        let matches = vec![m("/Library/LaunchDaemons/com.apple.foo.plist", 0.65, Strategy::NameFuzzy)];
        let c = classify(&matches, &rules(), 0.9);
        assert!(c.removable.is_empty());
        assert_eq!(c.ambiguous.len(), 1);
        assert!(c.protected.is_empty());
    }

    #[test]
    fn test_protection_ignores_confidence() {
        let matches = vec![
            m("/System/Library/Foo", 1.0, Strategy::Identifier),
            m("/Users/alice/Library/Caches", 1.0, Strategy::Identifier),
            m("/Users/alice/Library/Caches/com.foo.app", 1.0, Strategy::Identifier),
        ];
        for threshold in [0.0, 0.4, 0.6, 0.9, 1.0] {
            let c = classify(&matches, &rules(), threshold);
            assert_eq!(c.protected.len(), 2);
            assert!(c.protected.iter().all(|p| p.protected));
            assert!(c.removable.iter().all(|r| !r.path.starts_with("/System")));
        }
    }

    #[test]
    fn test_mode_ordering() {
        let matches = vec![
            m("/tmp/a", 1.0, Strategy::Identifier),
            m("/tmp/b", 0.9, Strategy::PathHeuristic),
            m("/tmp/c", 0.7, Strategy::NameFuzzy),
            m("/tmp/d", 0.4, Strategy::Metadata),
        ];
        let quick = classify(&matches, &rules(), 0.9).removable.len();
        let standard = classify(&matches, &rules(), 0.6).removable.len();
        let force = classify(&matches, &rules(), 0.4).removable.len();
        assert_eq!((quick, standard, force), (2, 3, 4));
    }

    #[test]
    fn test_removable_bytes() {
        let matches = vec![m("/tmp/a", 1.0, Strategy::Identifier), m("/tmp/b", 1.0, Strategy::Identifier)];
        assert_eq!(classify(&matches, &rules(), 0.6).removable_bytes(), 200);
    }
}
