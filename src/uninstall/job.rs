use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::apps::ApplicationIdentity;
use crate::common::{PurgeError, PurgeResult};
use crate::scanner::walker::ScanWarning;
use crate::scanner::Classification;

/// How aggressive an uninstall is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum UninstallMode {
    /// Only near-certain matches; running processes are left alone
    Quick,
    /// Default threshold; processes get a graceful shutdown
    Standard,
    /// Lowest threshold; processes are killed and file locks broken
    Force,
}

impl fmt::Display for UninstallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UninstallMode::Quick => write!(f, "quick"),
            UninstallMode::Standard => write!(f, "standard"),
            UninstallMode::Force => write!(f, "force"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Scanning,
    Classifying,
    AwaitingConfirmation,
    BackingUp,
    TerminatingProcesses,
    Removing,
    Verifying,
    Completed,
    Failed,
    RolledBack,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::RolledBack)
    }

    /// Legal moves of the uninstall state machine
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | RolledBack) {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Scanning)
                | (Scanning, Classifying)
                | (Classifying, AwaitingConfirmation)
                // unattended jobs skip the confirmation gate
                | (Classifying, BackingUp)
                | (AwaitingConfirmation, BackingUp)
                | (BackingUp, TerminatingProcesses)
                | (TerminatingProcesses, Removing)
                | (Removing, Verifying)
                | (Verifying, Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Scanning => "scanning",
            JobState::Classifying => "classifying",
            JobState::AwaitingConfirmation => "awaiting_confirmation",
            JobState::BackingUp => "backing_up",
            JobState::TerminatingProcesses => "terminating_processes",
            JobState::Removing => "removing",
            JobState::Verifying => "verifying",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller choices made when planning a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Pre-authorize the job; it never waits for `confirm`
    pub unattended: bool,
    /// Remove without sealing a snapshot first
    pub skip_backup: bool,
    /// Allow SIGKILL after the graceful timeout in standard mode
    pub allow_escalation: bool,
}

/// A failure recorded against a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub path: Option<PathBuf>,
    pub message: String,
}

impl JobError {
    pub fn new(err: &PurgeError, path: Option<PathBuf>) -> Self {
        Self {
            kind: err.kind().to_string(),
            path,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

/// One uninstall, from planning to a terminal state
#[derive(Debug, Clone, Serialize)]
pub struct UninstallJob {
    pub id: Uuid,
    pub identity: ApplicationIdentity,
    pub mode: UninstallMode,
    pub options: PlanOptions,
    /// Confidence threshold the classification used
    pub threshold: f64,
    pub state: JobState,
    pub confirmed: bool,
    pub classification: Classification,
    pub scan_warnings: Vec<ScanWarning>,
    pub snapshot_id: Option<String>,
    pub errors: Vec<JobError>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub history: Vec<StateChange>,
}

impl UninstallJob {
    pub fn new(identity: ApplicationIdentity, mode: UninstallMode, options: PlanOptions, threshold: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            identity,
            mode,
            options,
            threshold,
            state: JobState::Pending,
            confirmed: false,
            classification: Classification::default(),
            scan_warnings: Vec::new(),
            snapshot_id: None,
            errors: Vec::new(),
            failure_reason: None,
            created_at: now,
            history: vec![StateChange {
                state: JobState::Pending,
                at: now,
            }],
        }
    }

    /// Move to `next`, refusing transitions the state machine does not allow
    pub fn transition(&mut self, next: JobState) -> PurgeResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(PurgeError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::info!(job = %self.id, from = %self.state, to = %next, "job state change");
        self.state = next;
        self.history.push(StateChange {
            state: next,
            at: Utc::now(),
        });
        Ok(())
    }

    /// End the job as `Failed`. A job that already reached a terminal
    /// state keeps it.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.transition(JobState::Failed).is_ok() {
            tracing::warn!(job = %self.id, reason = %reason, "job failed");
            self.failure_reason = Some(reason);
        }
    }

    pub fn record_error(&mut self, err: &PurgeError, path: Option<PathBuf>) {
        self.errors.push(JobError::new(err, path));
    }

    /// True once the job may leave the confirmation gate
    pub fn is_authorized(&self) -> bool {
        self.confirmed || self.options.unattended
    }
}
