use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::system::launchd_program;
use super::{ProcessControl, ProcessHandle, Signal};
use crate::apps::ApplicationIdentity;
use crate::common::config::TerminationSettings;
use crate::common::{PurgeError, PurgeResult};
use crate::uninstall::job::UninstallMode;

/// How hard to push a process that does not exit
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TerminationPolicy {
    /// SIGTERM and wait; SIGKILL afterwards only with explicit approval
    Graceful { timeout: Duration, allow_escalation: bool },
    /// SIGTERM, short wait, then SIGKILL regardless
    Force { timeout: Duration },
}

impl TerminationPolicy {
    /// Policy for a mode; quick mode never terminates anything
    pub fn for_mode(mode: UninstallMode, settings: &TerminationSettings, allow_escalation: bool) -> Option<Self> {
        match mode {
            UninstallMode::Quick => None,
            UninstallMode::Standard => Some(TerminationPolicy::Graceful {
                timeout: settings.standard_timeout(),
                allow_escalation,
            }),
            UninstallMode::Force => Some(TerminationPolicy::Force {
                timeout: settings.force_timeout(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Exited after SIGTERM
    Exited,
    /// Needed SIGKILL
    Killed,
}

/// Finds and stops the processes of an application
#[derive(Clone)]
pub struct ProcessManager {
    control: Arc<dyn ProcessControl>,
    poll_interval: Duration,
}

impl ProcessManager {
    pub fn new(control: Arc<dyn ProcessControl>, poll_interval: Duration) -> Self {
        Self {
            control,
            poll_interval,
        }
    }

    pub fn control(&self) -> &dyn ProcessControl {
        self.control.as_ref()
    }

    /// Processes that belong to the application: anything executing from
    /// inside the bundle, plus the programs started by its launchd jobs.
    /// A matching command name alone is not enough; see [`Self::name_hints`].
    pub fn find_owners(&self, identity: &ApplicationIdentity, services: &[PathBuf]) -> PurgeResult<Vec<ProcessHandle>> {
        let programs: Vec<PathBuf> = services.iter().filter_map(|p| launchd_program(p)).collect();
        let own_pid = std::process::id();
        let mut owners: Vec<ProcessHandle> = self
            .control
            .list()?
            .into_iter()
            .filter(|p| p.pid != own_pid)
            .filter(|p| p.executable.starts_with(&identity.install_path) || programs.contains(&p.executable))
            .collect();
        owners.sort_by_key(|p| p.pid);
        owners.dedup_by_key(|p| p.pid);
        Ok(owners)
    }

    /// Processes named like the bundle executable but running from
    /// somewhere else. Reported, never signalled.
    pub fn name_hints(&self, identity: &ApplicationIdentity, owners: &[ProcessHandle]) -> PurgeResult<Vec<ProcessHandle>> {
        let Some(executable) = identity.executable.as_deref() else {
            return Ok(Vec::new());
        };
        let mut hints: Vec<ProcessHandle> = self
            .control
            .list()?
            .into_iter()
            .filter(|p| p.name == executable && !owners.iter().any(|o| o.pid == p.pid))
            .collect();
        hints.sort_by_key(|p| p.pid);
        Ok(hints)
    }

    /// Stop one process; escalation is sequential within the process
    pub fn terminate(&self, handle: &ProcessHandle, policy: TerminationPolicy) -> PurgeResult<TerminationOutcome> {
        let timeout = match policy {
            TerminationPolicy::Graceful { timeout, .. } | TerminationPolicy::Force { timeout } => timeout,
        };

        tracing::info!(pid = handle.pid, name = %handle.name, "sending SIGTERM");
        self.control.signal(handle.pid, Signal::Term)?;
        if self.wait_for_exit(handle.pid, timeout) {
            return Ok(TerminationOutcome::Exited);
        }

        let escalate = match policy {
            TerminationPolicy::Graceful { allow_escalation, .. } => allow_escalation,
            TerminationPolicy::Force { .. } => true,
        };
        if !escalate {
            tracing::warn!(pid = handle.pid, name = %handle.name, "process ignored SIGTERM");
            return Err(PurgeError::ProcessTerminationTimeout {
                pid: handle.pid,
                name: handle.name.clone(),
                timeout,
            });
        }

        tracing::warn!(pid = handle.pid, name = %handle.name, "escalating to SIGKILL");
        self.control.signal(handle.pid, Signal::Kill)?;
        if self.wait_for_exit(handle.pid, timeout) {
            Ok(TerminationOutcome::Killed)
        } else {
            Err(PurgeError::ProcessTerminationTimeout {
                pid: handle.pid,
                name: handle.name.clone(),
                timeout,
            })
        }
    }

    /// Stop every owner; independent processes are handled in parallel
    pub fn terminate_all(
        &self,
        owners: &[ProcessHandle],
        policy: TerminationPolicy,
    ) -> Vec<(ProcessHandle, PurgeResult<TerminationOutcome>)> {
        owners
            .par_iter()
            .map(|p| (p.clone(), self.terminate(p, policy)))
            .collect()
    }

    /// Kill whatever still holds the given paths open. Returns the pids
    /// that were signalled.
    pub fn break_locks(&self, paths: &[PathBuf]) -> Vec<u32> {
        let own_pid = std::process::id();
        let mut holders: Vec<u32> = paths
            .iter()
            .flat_map(|p| self.control.lock_holders(p))
            .filter(|pid| *pid != own_pid)
            .collect();
        holders.sort_unstable();
        holders.dedup();

        holders
            .into_iter()
            .filter(|pid| match self.control.signal(*pid, Signal::Kill) {
                Ok(()) => {
                    tracing::warn!(pid, "killed lock holder");
                    true
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "could not kill lock holder");
                    false
                }
            })
            .collect()
    }

    /// Break locks on a single path
    pub fn break_lock(&self, path: &Path) -> Vec<u32> {
        self.break_locks(&[path.to_path_buf()])
    }

    /// Poll until the process is gone or the timeout passes
    fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.control.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}
