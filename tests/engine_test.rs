use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use fspurge::apps::{self, ApplicationIdentity};
use fspurge::common::config::Config;
use fspurge::common::PurgeResult;
use fspurge::processes::{ProcessControl, ProcessHandle, ProcessManager, Signal};
use fspurge::scanner::cache::CacheStore;
use fspurge::scanner::catalog::PathCatalog;
use fspurge::scanner::matcher::Strategy;
use fspurge::uninstall::{CancelToken, Engine, JobObserver, JobState, NoopObserver, UninstallJob, UninstallMode};

// ─── Fixtures ─────────────────────────────────────────────────────────────────

/// A process table that is either empty or holds one process that
/// ignores every signal
#[derive(Default)]
struct StaticProcesses {
    stubborn: Option<ProcessHandle>,
}

impl ProcessControl for StaticProcesses {
    fn list(&self) -> PurgeResult<Vec<ProcessHandle>> {
        Ok(self.stubborn.iter().cloned().collect())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.stubborn.as_ref().is_some_and(|p| p.pid == pid)
    }

    fn signal(&self, _pid: u32, _signal: Signal) -> PurgeResult<()> {
        Ok(())
    }

    fn lock_holders(&self, _path: &Path) -> Vec<u32> {
        Vec::new()
    }

    fn unload_service(&self, _plist: &Path) -> PurgeResult<()> {
        Ok(())
    }
}

struct Sandbox {
    tmp: TempDir,
    home: PathBuf,
    app: PathBuf,
}

impl Sandbox {
    /// Foo.app plus four leftovers, all matching with confidence ≥ 0.85
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("home");

        let app = tmp.path().join("Applications/Foo.app");
        fs::create_dir_all(app.join("Contents/MacOS")).unwrap();
        fs::write(app.join("Contents/MacOS/Foo"), b"\x7fELF binary").unwrap();
        let mut dict = plist::Dictionary::new();
        dict.insert("CFBundleIdentifier".into(), plist::Value::String("com.foo.app".into()));
        dict.insert("CFBundleName".into(), plist::Value::String("Foo".into()));
        dict.insert("CFBundleExecutable".into(), plist::Value::String("Foo".into()));
        plist::Value::Dictionary(dict)
            .to_file_xml(app.join("Contents/Info.plist"))
            .unwrap();

        let support = home.join("Library/Application Support/Foo");
        fs::create_dir_all(&support).unwrap();
        fs::write(support.join("settings.json"), br#"{"theme":"dark"}"#).unwrap();

        let caches = home.join("Library/Caches/com.foo.app");
        fs::create_dir_all(&caches).unwrap();
        fs::write(caches.join("blob"), vec![7u8; 4096]).unwrap();

        let logs = home.join("Library/Logs/Foo");
        fs::create_dir_all(&logs).unwrap();
        fs::write(logs.join("foo.log"), b"started\n").unwrap();

        let prefs = home.join("Library/Preferences");
        fs::create_dir_all(&prefs).unwrap();
        fs::write(prefs.join("com.foo.app.plist"), b"<plist/>").unwrap();

        Self { tmp, home, app }
    }

    fn leftovers(&self) -> Vec<PathBuf> {
        vec![
            self.app.clone(),
            self.home.join("Library/Application Support/Foo"),
            self.home.join("Library/Caches/com.foo.app"),
            self.home.join("Library/Logs/Foo"),
            self.home.join("Library/Preferences/com.foo.app.plist"),
        ]
    }

    fn engine(&self, config: Config, processes: StaticProcesses) -> Engine {
        let catalog = PathCatalog::new(&self.home, self.tmp.path()).with_config(&config);
        let processes = ProcessManager::new(Arc::new(processes), Duration::from_millis(1));
        Engine::with_parts(
            config,
            catalog,
            Some(CacheStore::in_memory()),
            processes,
            self.tmp.path().join("data"),
        )
    }

    fn identity(&self) -> ApplicationIdentity {
        apps::identity_from_bundle(&self.app).unwrap()
    }
}

/// Cancels the job once a given number of entries are gone
struct CancelAfter {
    token: CancelToken,
    after: usize,
    states: Vec<JobState>,
}

impl JobObserver for CancelAfter {
    fn on_state(&mut self, job: &UninstallJob) {
        self.states.push(job.state);
    }

    fn on_removed(&mut self, _path: &Path, done: usize, _total: usize) {
        if done == self.after {
            self.token.cancel();
        }
    }
}

// ─── Planning ─────────────────────────────────────────────────────────────────

#[test]
fn test_plan_finds_every_leftover() {
    let sb = Sandbox::new();
    let engine = sb.engine(Config::default(), StaticProcesses::default());
    let job = engine.plan(sb.identity(), UninstallMode::Standard).unwrap();

    let planned: Vec<PathBuf> = job.classification.removable.iter().map(|m| m.path.clone()).collect();
    assert_eq!(planned, sb.leftovers());
    assert!(job.classification.protected.is_empty());
    assert_eq!(job.state, JobState::AwaitingConfirmation);

    // bundle, caches and preferences are claimed by bundle id
    for path in [
        sb.app.clone(),
        sb.home.join("Library/Caches/com.foo.app"),
        sb.home.join("Library/Preferences/com.foo.app.plist"),
    ] {
        let found = job.classification.removable.iter().find(|m| m.path == path).unwrap();
        assert_eq!(found.confidence, 1.0, "{}", path.display());
        assert!(found.matched_by.contains(&Strategy::Identifier));
    }
    // the name-only folders score lower but still pass the standard threshold
    for path in [
        sb.home.join("Library/Application Support/Foo"),
        sb.home.join("Library/Logs/Foo"),
    ] {
        let found = job.classification.removable.iter().find(|m| m.path == path).unwrap();
        assert!((found.confidence - 0.85).abs() < 1e-9);
        assert!(!found.matched_by.contains(&Strategy::Identifier));
    }
}

#[test]
fn test_quick_mode_keeps_fuzzy_matches_for_review() {
    let sb = Sandbox::new();
    let engine = sb.engine(Config::default(), StaticProcesses::default());
    let job = engine.plan(sb.identity(), UninstallMode::Quick).unwrap();

    // name-only matches score 0.85, below the quick threshold
    assert_eq!(job.classification.removable.len(), 3);
    assert_eq!(job.classification.ambiguous.len(), 2);
    assert!(job
        .classification
        .ambiguous
        .iter()
        .any(|m| m.path.ends_with("Application Support/Foo")));
}

#[test]
fn test_replanning_is_stable() {
    let sb = Sandbox::new();
    let engine = sb.engine(Config::default(), StaticProcesses::default());
    let first = engine.plan(sb.identity(), UninstallMode::Standard).unwrap();
    let second = engine.plan(sb.identity(), UninstallMode::Standard).unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(first.classification.removable, second.classification.removable);
    // install root plus four existing containers, all unchanged
    let stats = engine.cache_stats().unwrap();
    assert_eq!(stats.hits, 5);
    assert_eq!(stats.misses, 5);
}

#[test]
fn test_force_mode_leaves_system_plists_that_list_the_app() {
    let sb = Sandbox::new();
    let identity = sb.identity();
    let dock = sb.home.join("Library/Preferences/com.apple.dock.plist");
    let mut tile = plist::Dictionary::new();
    tile.insert(
        "_CFURLString".into(),
        plist::Value::String(format!("file://{}/", identity.install_path.display())),
    );
    let mut dict = plist::Dictionary::new();
    dict.insert(
        "persistent-apps".into(),
        plist::Value::Array(vec![plist::Value::Dictionary(tile)]),
    );
    plist::Value::Dictionary(dict).to_file_xml(&dock).unwrap();

    let engine = sb.engine(Config::default(), StaticProcesses::default());
    let mut job = engine.plan(identity, UninstallMode::Force).unwrap();
    assert!(!job.classification.removable.iter().any(|m| m.path == dock));
    assert_eq!(job.classification.removable.len(), 5);

    engine.confirm(&mut job).unwrap();
    let report = engine.execute(&mut job, &CancelToken::new(), &mut NoopObserver).unwrap();
    assert_eq!(report.state, JobState::Completed, "{:?}", report.errors);
    assert!(dock.exists());
}

// ─── Execution ────────────────────────────────────────────────────────────────

#[test]
fn test_declined_job_leaves_everything_in_place() {
    let sb = Sandbox::new();
    let engine = sb.engine(Config::default(), StaticProcesses::default());
    let mut job = engine.plan(sb.identity(), UninstallMode::Standard).unwrap();

    engine.decline(&mut job).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(sb.leftovers().iter().all(|p| p.exists()));
    assert!(engine.list_snapshots().unwrap().is_empty());
}

#[test]
fn test_cancel_mid_removal_keeps_a_restorable_snapshot() {
    let sb = Sandbox::new();
    let engine = sb.engine(Config::default(), StaticProcesses::default());
    let mut job = engine.plan(sb.identity(), UninstallMode::Standard).unwrap();
    engine.confirm(&mut job).unwrap();

    let token = CancelToken::new();
    let mut observer = CancelAfter {
        token: token.clone(),
        after: 3,
        states: Vec::new(),
    };
    let report = engine.execute(&mut job, &token, &mut observer).unwrap();

    assert_eq!(report.state, JobState::Failed);
    assert_eq!(report.failure_reason.as_deref(), Some("cancelled"));
    assert_eq!(report.removed.len(), 3);
    assert_eq!(report.not_attempted.len(), 2);
    assert!(observer.states.contains(&JobState::Removing));
    assert!(!observer.states.contains(&JobState::Verifying));

    let leftovers = sb.leftovers();
    assert!(leftovers[..3].iter().all(|p| !p.exists()));
    assert!(leftovers[3..].iter().all(|p| p.exists()));

    // No automatic rollback, but the snapshot is there to undo the job
    let snapshot_id = report.snapshot_id.unwrap();
    let restore = engine.restore(&snapshot_id).unwrap();
    assert!(restore.is_complete(), "{:?}", restore.errors);
    assert!(leftovers.iter().all(|p| p.exists()));
    assert_eq!(
        fs::read(sb.home.join("Library/Application Support/Foo/settings.json")).unwrap(),
        br#"{"theme":"dark"}"#
    );
}

#[test]
fn test_stubborn_process_rolls_back_and_keeps_snapshot() {
    let sb = Sandbox::new();
    let stubborn = ProcessHandle {
        pid: 48211,
        name: "Foo".into(),
        executable: sb.identity().install_path.join("Contents/MacOS/Foo"),
    };
    let mut config = Config::default();
    config.termination.standard_timeout_secs = 0;
    let engine = sb.engine(config, StaticProcesses { stubborn: Some(stubborn) });
    let mut job = engine.plan(sb.identity(), UninstallMode::Standard).unwrap();
    engine.confirm(&mut job).unwrap();

    let report = engine.execute(&mut job, &CancelToken::new(), &mut NoopObserver).unwrap();
    assert_eq!(report.state, JobState::RolledBack);
    assert!(report.removed.is_empty());
    assert!(report.restore.is_some());
    assert!(sb.leftovers().iter().all(|p| p.exists()));

    let snapshots = engine.list_snapshots().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(Some(&snapshots[0].id), report.snapshot_id.as_ref());
}

#[test]
fn test_same_named_process_elsewhere_is_left_running() {
    let sb = Sandbox::new();
    let unrelated = ProcessHandle {
        pid: 48212,
        name: "Foo".into(),
        executable: PathBuf::from("/opt/elsewhere/Foo"),
    };
    let engine = sb.engine(Config::default(), StaticProcesses { stubborn: Some(unrelated) });
    let mut job = engine.plan(sb.identity(), UninstallMode::Force).unwrap();
    engine.confirm(&mut job).unwrap();

    let report = engine.execute(&mut job, &CancelToken::new(), &mut NoopObserver).unwrap();
    assert_eq!(report.state, JobState::Completed, "{:?}", report.errors);
    assert!(sb.leftovers().iter().all(|p| !p.exists()));
}

#[test]
fn test_completed_job_can_be_undone_and_purged() {
    let sb = Sandbox::new();
    let engine = sb.engine(Config::default(), StaticProcesses::default());
    let mut job = engine.plan(sb.identity(), UninstallMode::Force).unwrap();
    engine.confirm(&mut job).unwrap();

    let report = engine.execute(&mut job, &CancelToken::new(), &mut NoopObserver).unwrap();
    assert_eq!(report.state, JobState::Completed, "{:?}", report.errors);
    assert!(sb.leftovers().iter().all(|p| !p.exists()));
    assert!(report.bytes_freed >= 4096);

    let snapshot_id = report.snapshot_id.unwrap();
    engine.restore(&snapshot_id).unwrap();
    assert!(sb.leftovers().iter().all(|p| p.exists()));

    let freed = engine.purge_snapshot(&snapshot_id).unwrap();
    assert!(freed > 0);
    assert!(engine.list_snapshots().unwrap().is_empty());
    assert_eq!(engine.restore(&snapshot_id).unwrap_err().kind(), "snapshot_not_found");
}

#[test]
fn test_job_log_records_each_job() {
    let sb = Sandbox::new();
    let engine = sb.engine(Config::default(), StaticProcesses::default());

    let mut declined = engine.plan(sb.identity(), UninstallMode::Standard).unwrap();
    engine.decline(&mut declined).unwrap();
    let mut done = engine.plan(sb.identity(), UninstallMode::Standard).unwrap();
    engine.confirm(&mut done).unwrap();
    engine.execute(&mut done, &CancelToken::new(), &mut NoopObserver).unwrap();

    let log = fs::read_dir(engine.logs_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| fs::read_to_string(e.path()).unwrap())
        .collect::<String>();
    let states: Vec<String> = log
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["state"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(states, vec!["failed", "completed"]);
}
