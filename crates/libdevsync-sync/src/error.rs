use libdevsync_core::DevsyncError;
use thiserror::Error;

/// Errors that can occur while talking to a remote
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote could not be reached; local work is unaffected
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    /// Another device moved the remote first
    #[error("push rejected: {0}")]
    Conflict(String),

    #[error("corrupt remote segment for device {device}: {reason}")]
    CorruptSegment { device: String, reason: String },

    /// The remote copy of this device's segment disagrees with the local one
    #[error("remote events of device {device} differ from the local log at seq {seq}")]
    Diverged { device: String, seq: u64 },

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<SyncError> },

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] DevsyncError),
}

impl SyncError {
    /// Worth retrying after a pause
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Unreachable(_))
    }
}

impl From<SyncError> for DevsyncError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Unreachable(msg) => DevsyncError::RemoteUnreachable(msg),
            SyncError::Conflict(msg) => DevsyncError::ConflictOnPush(msg),
            SyncError::CorruptSegment { device, reason } => DevsyncError::CorruptSegment { device, reason },
            SyncError::Diverged { device, seq } => DevsyncError::Diverged { device, seq },
            SyncError::RetriesExhausted { attempts, last } => match DevsyncError::from(*last) {
                DevsyncError::RemoteUnreachable(msg) => {
                    DevsyncError::RemoteUnreachable(format!("{} (after {} attempts)", msg, attempts))
                }
                DevsyncError::ConflictOnPush(msg) => {
                    DevsyncError::ConflictOnPush(format!("{} (after {} attempts)", msg, attempts))
                }
                other => other,
            },
            SyncError::Git(e) => DevsyncError::Internal(format!("git: {}", e.message())),
            SyncError::Io(e) => DevsyncError::Io(e),
            SyncError::Json(e) => DevsyncError::Json(e),
            SyncError::Core(e) => e,
        }
    }
}
