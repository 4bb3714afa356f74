use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

use super::{ProcessControl, ProcessHandle, ProcessUsage, Signal};
use crate::common::{PurgeError, PurgeResult};

/// `ProcessControl` for the running machine. The process table comes from
/// `sysinfo`; signals go through `kill`, lock holders through `lsof` and
/// launchd jobs through `launchctl`.
pub struct SystemProcesses {
    system: Mutex<System>,
}

impl SystemProcesses {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn system(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SystemProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessControl for SystemProcesses {
    fn list(&self) -> PurgeResult<Vec<ProcessHandle>> {
        let mut system = self.system();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut procs: Vec<ProcessHandle> = system
            .processes()
            .iter()
            .filter(|(_, p)| !matches!(p.status(), ProcessStatus::Zombie))
            .map(|(pid, p)| {
                let name = p.name().to_string_lossy().to_string();
                ProcessHandle {
                    pid: pid.as_u32(),
                    executable: p.exe().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(&name)),
                    name,
                }
            })
            .collect();
        procs.sort_by_key(|p| p.pid);
        Ok(procs)
    }

    /// Alive means present in the process table and not a zombie. Unlike
    /// `kill -0` this does not depend on being allowed to signal it.
    fn is_alive(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = self.system();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie))
    }

    fn signal(&self, pid: u32, signal: Signal) -> PurgeResult<()> {
        let output = Command::new("kill")
            .arg(signal.flag())
            .arg(pid.to_string())
            .output()
            .map_err(|e| PurgeError::io("kill", e))?;
        if output.status.success() {
            return Ok(());
        }

        // ESRCH: it exited on its own. Anything else (EPERM) is a failure.
        if self.is_alive(pid) {
            Err(PurgeError::Signal {
                pid,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn usage(&self, pid: u32) -> Option<ProcessUsage> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| ProcessUsage {
            memory_bytes: p.memory(),
            cpu_percent: p.cpu_usage(),
        })
    }

    fn lock_holders(&self, path: &Path) -> Vec<u32> {
        let mut cmd = Command::new("lsof");
        cmd.arg("-t");
        if path.is_dir() {
            cmd.arg("+D");
        } else {
            cmd.arg("--");
        }
        cmd.arg(path);

        match cmd.output() {
            Ok(out) => String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter_map(|l| l.trim().parse().ok())
                .collect(),
            Err(e) => {
                tracing::debug!(error = %e, "lsof unavailable");
                Vec::new()
            }
        }
    }

    fn unload_service(&self, plist: &Path) -> PurgeResult<()> {
        let label = launchd_label(plist);
        tracing::info!(plist = %plist.display(), label = label.as_deref().unwrap_or("?"), "unloading launchd job");

        let status = Command::new("launchctl")
            .arg("unload")
            .arg(plist)
            .status()
            .map_err(|e| PurgeError::io("launchctl", e))?;
        if status.success() {
            Ok(())
        } else {
            Err(PurgeError::Io {
                path: plist.to_path_buf(),
                source: std::io::Error::other(format!("launchctl unload exited with {}", status)),
            })
        }
    }
}

fn launchd_dict(plist: &Path) -> Option<plist::Dictionary> {
    plist::Value::from_file(plist).ok()?.into_dictionary()
}

/// `Label` of a launchd plist
pub fn launchd_label(plist: &Path) -> Option<String> {
    launchd_dict(plist)?
        .get("Label")
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Executable a launchd job starts: `Program`, else `ProgramArguments[0]`
pub fn launchd_program(plist: &Path) -> Option<PathBuf> {
    let dict = launchd_dict(plist)?;
    dict.get("Program")
        .and_then(|v| v.as_string())
        .or_else(|| {
            dict.get("ProgramArguments")
                .and_then(|v| v.as_array())
                .and_then(|args| args.first())
                .and_then(|v| v.as_string())
        })
        .map(PathBuf::from)
}

/// True for plists inside a LaunchAgents or LaunchDaemons directory
pub fn is_launchd_plist(path: &Path) -> bool {
    let in_launch_dir = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n == "LaunchAgents" || n == "LaunchDaemons")
        .unwrap_or(false);
    in_launch_dir && path.extension().and_then(|e| e.to_str()) == Some("plist")
}
