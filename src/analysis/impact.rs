use serde::Serialize;
use std::path::PathBuf;

use crate::apps::ApplicationIdentity;
use crate::common::PurgeResult;
use crate::processes::system::is_launchd_plist;
use crate::processes::{ProcessHandle, ProcessManager, ProcessUsage};
use crate::scanner::FileMatch;

/// A running owner and what it currently uses
#[derive(Debug, Clone, Serialize)]
pub struct ProcessImpact {
    #[serde(flatten)]
    pub process: ProcessHandle,
    pub usage: Option<ProcessUsage>,
}

/// How much of the machine an application occupies right now
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImpactReport {
    /// Processes running from the bundle or started by its launchd jobs
    pub processes: Vec<ProcessImpact>,
    /// Same command name, running from somewhere else
    pub process_hints: Vec<ProcessHandle>,
    /// Launch agents and daemons attributed to the app
    pub launch_items: Vec<PathBuf>,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
    pub install_bytes: u64,
    /// Everything attributed outside the bundle, protected entries excluded
    pub leftover_bytes: u64,
}

impl ImpactReport {
    pub fn disk_bytes(&self) -> u64 {
        self.install_bytes + self.leftover_bytes
    }
}

/// Measure processes, launchd jobs and disk use from a finished scan
pub fn measure(
    identity: &ApplicationIdentity,
    matches: &[FileMatch],
    processes: &ProcessManager,
) -> PurgeResult<ImpactReport> {
    let launch_items: Vec<PathBuf> = matches
        .iter()
        .filter(|m| !m.protected && is_launchd_plist(&m.path))
        .map(|m| m.path.clone())
        .collect();

    let owners = processes.find_owners(identity, &launch_items)?;
    let process_hints = processes.name_hints(identity, &owners)?;
    let owned: Vec<ProcessImpact> = owners
        .into_iter()
        .map(|process| ProcessImpact {
            usage: processes.control().usage(process.pid),
            process,
        })
        .collect();

    let (install, leftovers): (Vec<&FileMatch>, Vec<&FileMatch>) = matches
        .iter()
        .filter(|m| !m.protected)
        .partition(|m| m.path.starts_with(&identity.install_path));

    Ok(ImpactReport {
        memory_bytes: owned.iter().filter_map(|p| p.usage).map(|u| u.memory_bytes).sum(),
        cpu_percent: owned.iter().filter_map(|p| p.usage).map(|u| u.cpu_percent).sum(),
        processes: owned,
        process_hints,
        launch_items,
        install_bytes: install.iter().map(|m| m.size_bytes).sum(),
        leftover_bytes: leftovers.iter().map(|m| m.size_bytes).sum(),
    })
}
