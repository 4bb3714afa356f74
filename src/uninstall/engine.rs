use chrono::Utc;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::job::{JobError, JobState, PlanOptions, UninstallJob, UninstallMode};
use super::removal::Remover;
use super::{CancelToken, JobObserver};
use crate::analysis::{self, AnalysisReport};
use crate::apps::{self, ApplicationIdentity};
use crate::backup::{BackupManager, PurgeReport, RestoreReport, SnapshotLabel, SnapshotSummary};
use crate::common::config::Config;
use crate::common::{PurgeError, PurgeResult};
use crate::processes::system::is_launchd_plist;
use crate::processes::{ProcessManager, SystemProcesses, TerminationPolicy};
use crate::scanner::cache::{CacheStats, CacheStore};
use crate::scanner::catalog::{PathCatalog, ProtectionSet};
use crate::scanner::{classify, scan_identity, FileMatch};

pub const CACHE_FILE: &str = "scan_cache.json";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const LOGS_DIR: &str = "logs";

/// What `execute` did
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub job_id: Uuid,
    /// Terminal state of the job
    pub state: JobState,
    pub removed: Vec<PathBuf>,
    /// Removable entries never touched because the job stopped first
    pub not_attempted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
    pub bytes_freed: u64,
    pub snapshot_id: Option<String>,
    pub failure_reason: Option<String>,
    pub errors: Vec<JobError>,
    /// Present when a failed stage triggered a rollback
    pub restore: Option<RestoreReport>,
    pub duration_secs: f64,
}

impl ExecutionReport {
    fn new(job: &UninstallJob) -> Self {
        Self {
            job_id: job.id,
            state: job.state,
            removed: Vec::new(),
            not_attempted: job.classification.removable.iter().map(|m| m.path.clone()).collect(),
            failed: Vec::new(),
            bytes_freed: 0,
            snapshot_id: None,
            failure_reason: None,
            errors: Vec::new(),
            restore: None,
            duration_secs: 0.0,
        }
    }
}

/// Why the stage pipeline stopped early
enum Halt {
    Cancelled(JobState),
    Failed(String),
}

impl From<PurgeError> for Halt {
    fn from(e: PurgeError) -> Self {
        Halt::Failed(e.to_string())
    }
}

/// One line of the daily job log
#[derive(Serialize)]
struct JobLogEntry<'a> {
    timestamp: chrono::DateTime<Utc>,
    job_id: Uuid,
    bundle_id: &'a str,
    app_name: &'a str,
    mode: UninstallMode,
    state: JobState,
    failure_reason: Option<&'a str>,
    snapshot_id: Option<&'a str>,
    removed: usize,
    failed: usize,
    not_attempted: usize,
    bytes_freed: u64,
    errors: &'a [JobError],
}

/// Entry point for planning and running uninstalls
pub struct Engine {
    config: Config,
    catalog: PathCatalog,
    protection: ProtectionSet,
    cache: Option<CacheStore>,
    backups: BackupManager,
    processes: ProcessManager,
    data_dir: PathBuf,
}

impl Engine {
    /// Engine for the running user, keeping its state under `data_dir`
    pub fn open(config: Config, data_dir: impl Into<PathBuf>) -> PurgeResult<Self> {
        let data_dir = data_dir.into();
        let catalog = PathCatalog::from_config(&config);
        let cache = if config.scan.use_cache {
            let max_age = chrono::Duration::hours(config.scan.cache_max_age_hours as i64);
            Some(CacheStore::open(data_dir.join(CACHE_FILE))?.with_max_age(max_age))
        } else {
            None
        };
        let processes = ProcessManager::new(Arc::new(SystemProcesses::new()), config.termination.poll_interval());
        Ok(Self::with_parts(config, catalog, cache, processes, data_dir))
    }

    pub fn with_parts(
        config: Config,
        catalog: PathCatalog,
        cache: Option<CacheStore>,
        processes: ProcessManager,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        let data_dir = data_dir.into();
        Self {
            protection: catalog.protected_rules(),
            backups: BackupManager::new(data_dir.join(SNAPSHOTS_DIR)),
            config,
            catalog,
            cache,
            processes,
            data_dir,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &PathCatalog {
        &self.catalog
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join(LOGS_DIR)
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn resolve_identity(&self, name_or_path: &str) -> PurgeResult<ApplicationIdentity> {
        apps::resolve(name_or_path, &self.catalog.app_dirs())
    }

    /// Scan and classify without touching anything. The job waits for
    /// `confirm`.
    pub fn plan(&self, identity: ApplicationIdentity, mode: UninstallMode) -> PurgeResult<UninstallJob> {
        self.plan_with(identity, mode, PlanOptions::default())
    }

    pub fn plan_with(
        &self,
        identity: ApplicationIdentity,
        mode: UninstallMode,
        options: PlanOptions,
    ) -> PurgeResult<UninstallJob> {
        let threshold = self.config.thresholds.for_mode(mode);
        let mut job = UninstallJob::new(identity, mode, options, threshold);

        job.transition(JobState::Scanning)?;
        let outcome = scan_identity(
            &job.identity,
            &self.catalog,
            self.cache.as_ref(),
            self.config.scan.max_depth,
        );
        job.scan_warnings = outcome.warnings;

        job.transition(JobState::Classifying)?;
        job.classification = classify(&outcome.matches, &self.protection, threshold);
        tracing::info!(
            job = %job.id,
            app = %job.identity.bundle_id,
            mode = %mode,
            removable = job.classification.removable.len(),
            protected = job.classification.protected.len(),
            ambiguous = job.classification.ambiguous.len(),
            "job planned"
        );

        if !options.unattended {
            job.transition(JobState::AwaitingConfirmation)?;
        }
        Ok(job)
    }

    /// Report what the application runs, occupies and depends on. Nothing
    /// is signalled or removed.
    pub fn analyze(&self, identity: ApplicationIdentity) -> PurgeResult<AnalysisReport> {
        let outcome = scan_identity(
            &identity,
            &self.catalog,
            self.cache.as_ref(),
            self.config.scan.max_depth,
        );
        let threshold = self.config.thresholds.for_mode(UninstallMode::Standard);
        let classification = classify(&outcome.matches, &self.protection, threshold);
        let attributed: Vec<FileMatch> = classification
            .removable
            .into_iter()
            .chain(classification.protected)
            .collect();

        let impact = analysis::measure(&identity, &attributed, &self.processes)?;
        let dependencies = analysis::bundle_dependencies(&identity);
        tracing::info!(
            app = %identity.bundle_id,
            processes = impact.processes.len(),
            launch_items = impact.launch_items.len(),
            disk_bytes = impact.disk_bytes(),
            dependencies = dependencies.total(),
            "application analyzed"
        );

        Ok(AnalysisReport {
            identity,
            impact,
            dependencies,
            scan_warnings: outcome.warnings,
        })
    }

    /// Pass the confirmation gate
    pub fn confirm(&self, job: &mut UninstallJob) -> PurgeResult<()> {
        if job.state != JobState::AwaitingConfirmation {
            return Err(PurgeError::InvalidTransition {
                from: job.state.to_string(),
                to: "confirmed".into(),
            });
        }
        job.confirmed = true;
        tracing::info!(job = %job.id, "job confirmed");
        Ok(())
    }

    /// Refuse the job; it ends as `Failed` with nothing touched
    pub fn decline(&self, job: &mut UninstallJob) -> PurgeResult<()> {
        if job.state != JobState::AwaitingConfirmation {
            return Err(PurgeError::InvalidTransition {
                from: job.state.to_string(),
                to: JobState::Failed.to_string(),
            });
        }
        job.record_error(&PurgeError::UserDeclined, None);
        job.fail("user-declined");
        self.append_job_log(job, None);
        Ok(())
    }

    /// Run a confirmed (or unattended) job to a terminal state.
    ///
    /// Errors are only returned when the job may not start; everything
    /// that goes wrong afterwards ends up in the report.
    pub fn execute(
        &self,
        job: &mut UninstallJob,
        cancel: &CancelToken,
        observer: &mut dyn JobObserver,
    ) -> PurgeResult<ExecutionReport> {
        match job.state {
            JobState::AwaitingConfirmation if !job.confirmed => {
                return Err(PurgeError::NotConfirmed {
                    job_id: job.id.to_string(),
                })
            }
            JobState::AwaitingConfirmation => {}
            JobState::Classifying if job.options.unattended => {}
            other => {
                return Err(PurgeError::InvalidTransition {
                    from: other.to_string(),
                    to: JobState::BackingUp.to_string(),
                })
            }
        }

        let started = Instant::now();
        let mut report = ExecutionReport::new(job);

        match self.run_stages(job, cancel, observer, &mut report) {
            Ok(()) => {}
            Err(Halt::Cancelled(stage)) => {
                job.record_error(&PurgeError::Cancelled { stage: stage.to_string() }, None);
                job.fail("cancelled");
                observer.on_state(job);
            }
            Err(Halt::Failed(reason)) => match job.snapshot_id.clone() {
                Some(snapshot_id) => self.roll_back(job, &snapshot_id, reason, &mut report, observer),
                None => {
                    job.fail(reason);
                    observer.on_state(job);
                }
            },
        }

        report.state = job.state;
        report.snapshot_id = job.snapshot_id.clone();
        report.failure_reason = job.failure_reason.clone();
        report.errors = job.errors.clone();
        report.duration_secs = started.elapsed().as_secs_f64();

        tracing::info!(
            job = %job.id,
            state = %job.state,
            removed = report.removed.len(),
            failed = report.failed.len(),
            not_attempted = report.not_attempted.len(),
            bytes = report.bytes_freed,
            "job finished"
        );
        self.append_job_log(job, Some(&report));
        Ok(report)
    }

    fn run_stages(
        &self,
        job: &mut UninstallJob,
        cancel: &CancelToken,
        observer: &mut dyn JobObserver,
        report: &mut ExecutionReport,
    ) -> Result<(), Halt> {
        check_cancel(cancel, job.state)?;
        advance(job, JobState::BackingUp, observer)?;
        self.back_up(job)?;

        check_cancel(cancel, job.state)?;
        advance(job, JobState::TerminatingProcesses, observer)?;
        self.stop_owners(job)?;

        check_cancel(cancel, job.state)?;
        advance(job, JobState::Removing, observer)?;
        self.remove_all(job, cancel, observer, report)?;

        advance(job, JobState::Verifying, observer)?;
        self.verify(job, report)?;

        advance(job, JobState::Completed, observer)?;
        Ok(())
    }

    fn back_up(&self, job: &mut UninstallJob) -> Result<(), Halt> {
        if job.options.skip_backup || !self.config.backup_enabled {
            tracing::info!(job = %job.id, "backups disabled for this job");
            return Ok(());
        }
        if job.classification.removable.is_empty() {
            return Ok(());
        }

        let label = SnapshotLabel {
            bundle_id: job.identity.bundle_id.clone(),
            app_name: job.identity.display_name.clone(),
            mode: job.mode.to_string(),
        };
        match self.backups.seal(&job.classification.removable, label) {
            Ok(snapshot) => {
                job.snapshot_id = Some(snapshot.id().to_string());
                Ok(())
            }
            Err(e) => {
                job.record_error(&e, None);
                Err(Halt::Failed(format!("backup failed: {}", e)))
            }
        }
    }

    fn stop_owners(&self, job: &mut UninstallJob) -> Result<(), Halt> {
        let Some(policy) = TerminationPolicy::for_mode(job.mode, &self.config.termination, job.options.allow_escalation)
        else {
            tracing::debug!(job = %job.id, "quick mode leaves processes running");
            return Ok(());
        };

        let services = launchd_jobs(&job.classification.removable);
        let owners = self.processes.find_owners(&job.identity, &services).map_err(|e| {
            job.record_error(&e, None);
            Halt::Failed(format!("cannot list processes: {}", e))
        })?;

        let mut still_running = 0;
        for (handle, result) in self.processes.terminate_all(&owners, policy) {
            match result {
                Ok(outcome) => tracing::info!(pid = handle.pid, name = %handle.name, ?outcome, "process stopped"),
                Err(e) => {
                    still_running += 1;
                    job.record_error(&e, Some(handle.executable.clone()));
                }
            }
        }
        if still_running > 0 {
            return Err(Halt::Failed(format!("{} process(es) still running", still_running)));
        }

        if job.mode == UninstallMode::Force {
            let paths: Vec<PathBuf> = job.classification.removable.iter().map(|m| m.path.clone()).collect();
            let killed = self.processes.break_locks(&paths);
            if !killed.is_empty() {
                tracing::warn!(job = %job.id, killed = killed.len(), "killed processes holding files open");
            }
        }
        Ok(())
    }

    fn remove_all(
        &self,
        job: &mut UninstallJob,
        cancel: &CancelToken,
        observer: &mut dyn JobObserver,
        report: &mut ExecutionReport,
    ) -> Result<(), Halt> {
        // Roots must be collected while the install path still exists
        let roots: Vec<PathBuf> = self
            .catalog
            .roots(&job.identity)
            .into_iter()
            .map(|r| r.path)
            .collect();
        let remover = Remover::new(&self.protection, &self.processes, self.config.removal_retries)
            .force(job.mode == UninstallMode::Force)
            .unload_services(job.mode != UninstallMode::Quick);

        let entries = job.classification.removable.clone();
        let total = entries.len();
        report.not_attempted.clear();
        let mut cancelled = false;

        for (i, entry) in entries.iter().enumerate() {
            if cancel.is_cancelled() {
                report.not_attempted = entries[i..].iter().map(|e| e.path.clone()).collect();
                cancelled = true;
                break;
            }
            match remover.remove(entry) {
                Ok(bytes) => {
                    tracing::debug!(path = %entry.path.display(), bytes, "removed");
                    report.removed.push(entry.path.clone());
                    report.bytes_freed += bytes;
                    observer.on_removed(&entry.path, i + 1, total);
                }
                Err(e) => {
                    if e.is_soft() {
                        tracing::warn!(path = %entry.path.display(), error = %e, "removal failed");
                    } else {
                        tracing::error!(path = %entry.path.display(), error = %e, "removal refused");
                    }
                    job.record_error(&e, Some(entry.path.clone()));
                    report.failed.push(entry.path.clone());
                }
            }
        }

        self.invalidate_cache(&roots, &report.removed);
        if cancelled {
            return Err(Halt::Cancelled(JobState::Removing));
        }
        Ok(())
    }

    /// Every removed entry must really be gone
    fn verify(&self, job: &mut UninstallJob, report: &mut ExecutionReport) -> Result<(), Halt> {
        let (gone, present): (Vec<PathBuf>, Vec<PathBuf>) = report
            .removed
            .drain(..)
            .partition(|p| std::fs::symlink_metadata(p).is_err());
        report.removed = gone;

        for path in present {
            let err = PurgeError::Io {
                path: path.clone(),
                source: std::io::Error::other("still present after removal"),
            };
            job.record_error(&err, Some(path.clone()));
            report.failed.push(path);
        }

        if report.failed.is_empty() {
            Ok(())
        } else {
            Err(Halt::Failed(format!("{} entries could not be removed", report.failed.len())))
        }
    }

    fn roll_back(
        &self,
        job: &mut UninstallJob,
        snapshot_id: &str,
        reason: String,
        report: &mut ExecutionReport,
        observer: &mut dyn JobObserver,
    ) {
        tracing::warn!(job = %job.id, snapshot = snapshot_id, reason = %reason, "rolling back");
        match self.backups.restore(snapshot_id) {
            Ok(restore) => {
                for failure in &restore.errors {
                    job.errors.push(JobError {
                        kind: failure.kind.clone(),
                        path: Some(failure.path.clone()),
                        message: failure.message.clone(),
                    });
                }
                report.restore = Some(restore);
                if job.transition(JobState::RolledBack).is_ok() {
                    job.failure_reason = Some(reason);
                }
                self.invalidate_cache(
                    &self.catalog.roots(&job.identity).into_iter().map(|r| r.path).collect::<Vec<_>>(),
                    &report.removed,
                );
            }
            Err(e) => {
                job.record_error(&e, None);
                job.fail(format!("{}; rollback failed: {}", reason, e));
            }
        }
        observer.on_state(job);
    }

    fn invalidate_cache(&self, roots: &[PathBuf], touched: &[PathBuf]) {
        let Some(cache) = &self.cache else { return };
        let mut dropped = 0;
        for root in roots {
            if touched.iter().any(|p| p.starts_with(root)) {
                dropped += cache.invalidate(root);
            }
        }
        tracing::debug!(dropped, "cache entries invalidated");
    }

    /// Append the job to `<data>/logs/jobs-YYYY-MM-DD.jsonl`. Failures are
    /// logged, never returned.
    fn append_job_log(&self, job: &UninstallJob, report: Option<&ExecutionReport>) {
        let entry = JobLogEntry {
            timestamp: Utc::now(),
            job_id: job.id,
            bundle_id: &job.identity.bundle_id,
            app_name: &job.identity.display_name,
            mode: job.mode,
            state: job.state,
            failure_reason: job.failure_reason.as_deref(),
            snapshot_id: job.snapshot_id.as_deref(),
            removed: report.map(|r| r.removed.len()).unwrap_or(0),
            failed: report.map(|r| r.failed.len()).unwrap_or(0),
            not_attempted: report
                .map(|r| r.not_attempted.len())
                .unwrap_or(job.classification.removable.len()),
            bytes_freed: report.map(|r| r.bytes_freed).unwrap_or(0),
            errors: &job.errors,
        };

        let log_dir = self.logs_dir();
        let log_path = log_dir.join(format!("jobs-{}.jsonl", entry.timestamp.format("%Y-%m-%d")));
        let result = std::fs::create_dir_all(&log_dir).and_then(|_| {
            let line = serde_json::to_string(&entry).map_err(std::io::Error::other)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;
            writeln!(file, "{}", line)
        });
        if let Err(e) = result {
            tracing::warn!(path = %log_path.display(), error = %e, "could not write job log");
        }
    }

    /// Snapshots, newest first
    pub fn list_snapshots(&self) -> PurgeResult<Vec<SnapshotSummary>> {
        self.backups.list()
    }

    pub fn restore(&self, snapshot_id: &str) -> PurgeResult<RestoreReport> {
        let report = self.backups.restore(snapshot_id)?;
        if let Some(cache) = &self.cache {
            // Restored files change the roots they land in
            cache.clear();
        }
        Ok(report)
    }

    pub fn purge_snapshot(&self, snapshot_id: &str) -> PurgeResult<u64> {
        self.backups.purge(snapshot_id)
    }

    /// Drop snapshots older than the configured retention
    pub fn purge_expired_snapshots(&self) -> PurgeResult<PurgeReport> {
        self.backups.purge_expired(self.config.snapshot_retention_days)
    }

    pub fn purge_all_snapshots(&self) -> PurgeResult<PurgeReport> {
        self.backups.purge_all()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    /// Forget every cached scan, on disk as well
    pub fn clear_cache(&self) -> PurgeResult<()> {
        if let Some(cache) = &self.cache {
            cache.clear();
            cache.flush()?;
        }
        Ok(())
    }

    /// Flush the cache to disk
    pub fn close(self) -> PurgeResult<()> {
        match self.cache {
            Some(cache) => cache.close(),
            None => Ok(()),
        }
    }
}

/// Launchd plists among the matches; their programs count as owners
fn launchd_jobs(matches: &[FileMatch]) -> Vec<PathBuf> {
    matches
        .iter()
        .filter(|m| is_launchd_plist(&m.path))
        .map(|m| m.path.clone())
        .collect()
}

fn check_cancel(cancel: &CancelToken, stage: JobState) -> Result<(), Halt> {
    if cancel.is_cancelled() {
        Err(Halt::Cancelled(stage))
    } else {
        Ok(())
    }
}

fn advance(job: &mut UninstallJob, next: JobState, observer: &mut dyn JobObserver) -> Result<(), Halt> {
    job.transition(next)?;
    observer.on_state(job);
    Ok(())
}
