use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Typed errors for engine operations.
/// The CLI wraps these in `anyhow` at the top level, but every engine
/// module returns `PurgeError` so callers can tell soft failures from
/// stage-level ones.
#[derive(Debug, Error)]
pub enum PurgeError {
    /// Permission denied accessing a path (soft during scans)
    #[error("Permission denied: '{}'. {hint}", path.display())]
    PermissionDenied { path: PathBuf, hint: String },

    /// File system operation failed
    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A process did not exit within its graceful window
    #[error("Process {pid} ({name}) did not exit within {}s", timeout.as_secs())]
    ProcessTerminationTimeout {
        pid: u32,
        name: String,
        timeout: Duration,
    },

    /// Sending a signal failed for a process that is still alive
    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    /// A file stayed busy after every retry
    #[error("File is locked: '{}' ({attempts} attempts)", path.display())]
    LockedFile { path: PathBuf, attempts: u32 },

    /// Snapshot archive or manifest failed verification
    #[error("Snapshot '{snapshot_id}' is corrupt: {message}")]
    SnapshotCorrupt {
        snapshot_id: String,
        message: String,
    },

    /// The caller refused the confirmation gate
    #[error("Uninstall declined by user")]
    UserDeclined,

    /// No application matched the requested name or path
    #[error("Application not found: '{query}'")]
    NotFound { query: String },

    /// Application bundle could not be turned into an identity
    #[error("App error for '{name}': {message}")]
    AppError { name: String, message: String },

    #[error("Snapshot '{snapshot_id}' not found")]
    SnapshotNotFound { snapshot_id: String },

    /// State machine refused a transition
    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// `execute` was called before the confirmation gate was passed
    #[error("Job {job_id} has not been confirmed")]
    NotConfirmed { job_id: String },

    /// A protected path reached the removal step
    #[error("SAFETY: refusing to remove protected path: '{}'", path.display())]
    ProtectedPath { path: PathBuf },

    #[error("Operation cancelled during {stage}")]
    Cancelled { stage: String },

    /// Archive (zip) failure while sealing or restoring
    #[error("Archive error at '{}': {message}", path.display())]
    Archive { path: PathBuf, message: String },

    /// Configuration is invalid
    #[error("Config error: {message}")]
    Config { message: String },
}

pub type PurgeResult<T> = std::result::Result<T, PurgeError>;

impl PurgeError {
    /// Wrap an I/O error with the path it happened at, classifying
    /// permission problems separately.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            let hint = crate::common::permissions::permission_hint(&path);
            PurgeError::PermissionDenied { path, hint }
        } else {
            PurgeError::Io { path, source }
        }
    }

    /// Short machine-friendly tag, used in job logs and JSON output
    pub fn kind(&self) -> &'static str {
        match self {
            PurgeError::PermissionDenied { .. } => "permission_denied",
            PurgeError::Io { .. } => "io_error",
            PurgeError::ProcessTerminationTimeout { .. } => "process_termination_timeout",
            PurgeError::Signal { .. } => "signal_failed",
            PurgeError::LockedFile { .. } => "locked_file",
            PurgeError::SnapshotCorrupt { .. } => "snapshot_corrupt",
            PurgeError::UserDeclined => "user_declined",
            PurgeError::NotFound { .. } => "not_found",
            PurgeError::AppError { .. } => "app_error",
            PurgeError::SnapshotNotFound { .. } => "snapshot_not_found",
            PurgeError::InvalidTransition { .. } => "invalid_transition",
            PurgeError::NotConfirmed { .. } => "not_confirmed",
            PurgeError::ProtectedPath { .. } => "protected_path",
            PurgeError::Cancelled { .. } => "cancelled",
            PurgeError::Archive { .. } => "archive_error",
            PurgeError::Config { .. } => "config_error",
        }
    }

    /// Soft errors are recorded and the surrounding operation carries on
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            PurgeError::PermissionDenied { .. } | PurgeError::Io { .. } | PurgeError::LockedFile { .. }
        )
    }
}
