//! Uninstall orchestration: planning, the confirmation gate and the
//! staged execution of a job.

pub mod engine;
pub mod job;
pub mod removal;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use engine::{Engine, ExecutionReport};
pub use job::{JobError, JobState, PlanOptions, UninstallJob, UninstallMode};

/// Shared cancellation flag. Checked at stage boundaries and between
/// files while removing.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress callbacks from `Engine::execute`
pub trait JobObserver {
    /// Called after every state change
    fn on_state(&mut self, _job: &UninstallJob) {}

    /// Called after each removable entry is gone
    fn on_removed(&mut self, _path: &Path, _done: usize, _total: usize) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl JobObserver for NoopObserver {}
