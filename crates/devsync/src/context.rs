use std::path::PathBuf;

use libdevsync_core::config::{resolve_data_dir, state_path};
use libdevsync_core::{DevsyncError, EventKind, Replica};
use libdevsync_sync::{connect, SyncTransport};
use crate::cli::Cli;

/// Resolved context for a devsync command
pub struct DevsyncContext {
    pub data_dir: PathBuf,
    pub replica: Replica,
}

impl DevsyncContext {
    /// Data directory resolution order:
    /// 1. --data-dir or DEVSYNC_HOME
    /// 2. the platform data directory
    pub fn data_dir(cli: &Cli) -> Result<PathBuf, DevsyncError> {
        resolve_data_dir(cli.data_dir.as_deref())
    }

    /// Open the replica for an initialized data directory
    pub fn resolve(cli: &Cli) -> Result<Self, DevsyncError> {
        let data_dir = Self::data_dir(cli)?;
        let replica = Replica::open(&data_dir)?;
        Ok(Self { data_dir, replica })
    }

    pub fn device_id(&self) -> &str {
        self.replica.device_id()
    }

    pub fn sled_path(&self) -> PathBuf {
        state_path(&self.data_dir)
    }

    /// Record a local mutation
    pub fn record(&self, kind: EventKind) -> Result<u64, DevsyncError> {
        Ok(self.replica.record(kind)?.seq)
    }

    /// Transport to the configured remote
    pub fn transport(&self) -> Result<SyncTransport<'_, Box<dyn libdevsync_sync::Remote>>, DevsyncError> {
        let remote = connect(&self.replica)?;
        Ok(SyncTransport::new(&self.replica, remote))
    }
}
