use thiserror::Error;

/// Main error type for devsync operations
#[derive(Debug, Error)]
pub enum DevsyncError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A local mutation could not be made durable. Fatal to the command.
    #[error("local write failed: {context}: {source}")]
    LocalWrite {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("push conflict: {0}")]
    ConflictOnPush(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("corrupt segment for device {device}: {reason}")]
    CorruptSegment { device: String, reason: String },

    /// The remote holds events for this device that the local log does not
    #[error("device {device} diverged from its published events at seq {seq}")]
    Diverged { device: String, seq: u64 },

    #[error("database busy: {0}")]
    DbBusy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("ID parse error: {0}")]
    IdParse(#[from] crate::types::ids::IdParseError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DevsyncError {
    /// Get the error code for JSON output
    pub fn error_code(&self) -> &'static str {
        match self {
            DevsyncError::InvalidArgs(_) => "invalid_args",
            DevsyncError::NotFound(_) => "not_found",
            DevsyncError::LocalWrite { .. } => "local_write_error",
            DevsyncError::RemoteUnreachable(_) => "remote_unreachable",
            DevsyncError::ConflictOnPush(_) => "conflict",
            DevsyncError::SchemaMismatch(_) => "schema_mismatch",
            DevsyncError::CorruptSegment { .. } => "corrupt_segment",
            DevsyncError::Diverged { .. } => "diverged",
            DevsyncError::DbBusy(_) => "db_busy",
            DevsyncError::Io(_) => "io_error",
            DevsyncError::Sled(_) => "db_error",
            DevsyncError::Json(_) => "internal_error",
            DevsyncError::TomlParse(_) => "invalid_args",
            DevsyncError::TomlSerialize(_) => "internal_error",
            DevsyncError::IdParse(_) => "invalid_args",
            DevsyncError::Internal(_) => "internal_error",
        }
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            DevsyncError::InvalidArgs(_) => 2,
            DevsyncError::NotFound(_) => 3,
            DevsyncError::ConflictOnPush(_) => 4,
            DevsyncError::DbBusy(_) => 5,
            DevsyncError::LocalWrite { .. } => 5,
            DevsyncError::Io(_) => 5,
            DevsyncError::Sled(_) => 5,
            DevsyncError::IdParse(_) => 2,
            DevsyncError::TomlParse(_) => 2,
            DevsyncError::RemoteUnreachable(_) => 6,
            DevsyncError::CorruptSegment { .. } => 7,
            DevsyncError::Diverged { .. } => 7,
            _ => 1,
        }
    }

    /// Get actionable suggestions for fixing the error
    pub fn suggestions(&self) -> Vec<&'static str> {
        match self {
            DevsyncError::NotFound(msg) => {
                if msg.contains("device") {
                    vec!["Run 'devsync init' to set up this device"]
                } else if msg.contains("remote") {
                    vec!["Run 'devsync remote set-dir <path>' or 'devsync remote set-git <url>'"]
                } else {
                    vec![]
                }
            }
            DevsyncError::LocalWrite { .. } => vec![
                "The mutation was NOT recorded; check disk space and permissions",
                "Re-run the command once the data directory is writable",
            ],
            DevsyncError::RemoteUnreachable(_) => vec![
                "Local changes are kept and will be pushed on the next sync",
                "Check the remote path is mounted or the git URL is reachable",
            ],
            DevsyncError::ConflictOnPush(_) => vec![
                "Another device pushed concurrently; run 'devsync sync' again",
            ],
            DevsyncError::CorruptSegment { .. } => vec![
                "Run 'devsync db check' to list corrupt segments",
                "Run 'devsync db quarantine <device>' then 'devsync rebuild --resync'",
            ],
            DevsyncError::Diverged { .. } => vec![
                "Another data directory is publishing under this device id",
                "To take over a device id, run 'devsync init --device-id <id>' in an empty data directory",
            ],
            DevsyncError::DbBusy(_) => vec![
                "Another devsync process holds the state cache; wait for it to finish",
            ],
            DevsyncError::Sled(_) => vec![
                "Run 'devsync rebuild' to recreate the state cache from the event log",
                "If problem persists, check disk space and permissions",
            ],
            DevsyncError::IdParse(_) => vec![
                "Device ids may contain letters, digits, '-', '_' and '.'",
            ],
            _ => vec![],
        }
    }

    /// Wrap an IO failure on the local write path
    pub fn local_write(context: impl Into<String>, source: std::io::Error) -> Self {
        DevsyncError::LocalWrite {
            context: context.into(),
            source,
        }
    }

    /// Create a DbBusy error with optional details
    pub fn database_locked(details: Option<&str>) -> Self {
        let msg = match details {
            Some(d) => format!("State cache is locked ({})", d),
            None => "State cache is locked by another process".to_string(),
        };
        DevsyncError::DbBusy(msg)
    }
}
