//! Error taxonomy for working-copy operations

use std::path::PathBuf;

/// Result type for working-copy operations
pub type Result<T> = std::result::Result<T, WcError>;

/// Errors that can occur while reading or mutating a working copy
#[derive(Debug, thiserror::Error)]
pub enum WcError {
    /// Structural damage to on-disk metadata. Fatal for the directory,
    /// never silently repaired.
    #[error("Corrupt working copy metadata in '{dir}': {reason}")]
    Corrupt { dir: PathBuf, reason: String },

    #[error("Working copy '{0}' is locked")]
    Locked(PathBuf),

    #[error("Working copy '{0}' is not locked")]
    NotLocked(PathBuf),

    #[error("Directory '{0}' is missing")]
    MissingDir(PathBuf),

    #[error("'{0}' is not a working copy directory")]
    MissingAdminArea(PathBuf),

    #[error("Failed to add '{0}': an object of the same name already exists")]
    Obstructed(PathBuf),

    #[error("Checksum mismatch for text base of '{path}': expected '{expected}', actual '{actual}'")]
    CorruptTextBase {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Checksum mismatch for '{path}': expected '{expected}', actual '{actual}'")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("'{url}' is not under repository root '{root}'")]
    InvalidSwitch { url: String, root: String },

    #[error("Cannot schedule '{path}': {reason}")]
    ScheduleConflict { path: PathBuf, reason: String },

    /// Caller-requested cancellation; unwinds cleanly, releasing locks.
    #[error("Operation cancelled")]
    Cancelled,

    /// A log command failed during replay. The log files stay on disk so
    /// the next open of the directory retries the sequence.
    #[error("Log command '{command}' failed in '{dir}': {source}")]
    LogCommand {
        command: String,
        dir: PathBuf,
        #[source]
        source: Box<WcError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WcError {
    /// Attach the originating command name and directory to a replay error.
    pub(crate) fn in_command(self, command: &str, dir: &std::path::Path) -> WcError {
        WcError::LogCommand {
            command: command.to_string(),
            dir: dir.to_path_buf(),
            source: Box::new(self),
        }
    }

    pub(crate) fn corrupt(dir: &std::path::Path, reason: impl Into<String>) -> WcError {
        WcError::Corrupt {
            dir: dir.to_path_buf(),
            reason: reason.into(),
        }
    }
}
