//! Running processes that belong to an application, and how to stop them.

pub mod manager;
pub mod system;

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::common::PurgeResult;

pub use manager::{ProcessManager, TerminationOutcome, TerminationPolicy};
pub use system::SystemProcesses;

/// A running process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub name: String,
    pub executable: PathBuf,
}

/// Resource use of one process at the time it was sampled
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProcessUsage {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM
    Term,
    /// SIGKILL
    Kill,
}

impl Signal {
    pub fn flag(&self) -> &'static str {
        match self {
            Signal::Term => "-TERM",
            Signal::Kill => "-KILL",
        }
    }
}

/// OS process operations. The engine only talks to processes through
/// this trait.
pub trait ProcessControl: Send + Sync {
    /// Every running process
    fn list(&self) -> PurgeResult<Vec<ProcessHandle>>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Send a signal. A process that is gone counts as success; one that
    /// is still alive afterwards (e.g. not ours to signal) is an error.
    fn signal(&self, pid: u32, signal: Signal) -> PurgeResult<()>;

    /// Memory and CPU of a live process, when the platform reports them
    fn usage(&self, _pid: u32) -> Option<ProcessUsage> {
        None
    }

    /// Processes holding `path` (or anything under it) open
    fn lock_holders(&self, path: &Path) -> Vec<u32>;

    /// Unload the launchd job defined by a plist before it is removed
    fn unload_service(&self, plist: &Path) -> PurgeResult<()>;
}
