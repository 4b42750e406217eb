//! One device's view of the synced workspace
//!
//! Ties together the device identity, the event log and the state cache.
//! Transports and the CLI work through this type.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{
    device_config_path, load_config, load_device_config, save_config, save_device_config,
    state_path, DevsyncConfig,
};
use crate::error::DevsyncError;
use crate::log::EventLog;
use crate::replay::{CatchUpReport, RebuildReport, ReplayEngine, VerifyReport};
use crate::store::{LockedStore, StateStore};
use crate::types::device::DeviceConfig;
use crate::types::event::{Event, EventKind};
use crate::types::state::MaterializedState;

/// How long a mutation waits for the cache before deferring its apply
pub const RECORD_CACHE_TIMEOUT: Duration = Duration::from_millis(250);

/// How long reads and rebuilds wait for the cache
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Replica {
    data_dir: PathBuf,
    device: DeviceConfig,
    config: DevsyncConfig,
    log: EventLog,
}

impl Replica {
    /// Set up a data directory for this device. Re-running on an initialized
    /// directory returns the existing replica.
    ///
    /// An explicit `device_id` may name a device that already published
    /// events. Until the first sync reconciles this directory with them
    /// (see [`EventLog::restore_own`]), `restore_pending` stays set.
    pub fn init(
        data_dir: &Path,
        device_id: Option<String>,
        label: Option<String>,
    ) -> Result<Self, DevsyncError> {
        if device_config_path(data_dir).exists() {
            let replica = Self::open(data_dir)?;
            if let Some(requested) = device_id {
                if requested != replica.device.device_id {
                    return Err(DevsyncError::InvalidArgs(format!(
                        "data directory already belongs to device {}",
                        replica.device.device_id
                    )));
                }
            }
            return Ok(replica);
        }

        let device = DeviceConfig::new(device_id, label);
        save_device_config(data_dir, &device)?;
        if load_config(data_dir)?.is_none() {
            save_config(data_dir, &DevsyncConfig::default())?;
        }
        info!(device = %device.device_id, path = %data_dir.display(), "initialized device");
        Self::open(data_dir)
    }

    /// Open an initialized data directory
    pub fn open(data_dir: &Path) -> Result<Self, DevsyncError> {
        let device = load_device_config(data_dir)?;
        let config = load_config(data_dir)?.unwrap_or_default();
        let log = EventLog::open(data_dir, &device.device_id)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            device,
            config,
            log,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn device_id(&self) -> &str {
        &self.device.device_id
    }

    pub fn config(&self) -> &DevsyncConfig {
        &self.config
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Whether this directory still has to take over its device's
    /// published events. Read from disk, another process may have finished it.
    pub fn restore_pending(&self) -> Result<bool, DevsyncError> {
        Ok(load_device_config(&self.data_dir)?.restore_pending)
    }

    /// Clear `restore_pending` once the own segment matches the remote
    pub fn finish_restore(&self) -> Result<(), DevsyncError> {
        let mut device = load_device_config(&self.data_dir)?;
        if device.restore_pending {
            device.restore_pending = false;
            save_device_config(&self.data_dir, &device)?;
            debug!(device = %device.device_id, "own segment restored");
        }
        Ok(())
    }

    /// Replace and persist the workspace config
    pub fn save_config(&mut self, config: DevsyncConfig) -> Result<(), DevsyncError> {
        save_config(&self.data_dir, &config)?;
        self.config = config;
        Ok(())
    }

    /// Open the state cache, waiting up to the default timeout
    pub fn open_store(&self) -> Result<LockedStore, DevsyncError> {
        self.open_store_with_timeout(DEFAULT_STORE_TIMEOUT)
    }

    pub fn open_store_with_timeout(&self, timeout: Duration) -> Result<LockedStore, DevsyncError> {
        StateStore::open_locked_blocking(&state_path(&self.data_dir), timeout)
    }

    /// Record a local mutation.
    ///
    /// The event is durable once this returns. Updating the cache is best
    /// effort: if another process holds it the apply is left to the next
    /// catch-up.
    pub fn record(&self, kind: EventKind) -> Result<Event, DevsyncError> {
        let event = self.log.append(kind)?;

        match self.open_store_with_timeout(RECORD_CACHE_TIMEOUT) {
            Ok(store) => {
                if let Err(e) = ReplayEngine::new(&self.log, &store).apply_new(std::slice::from_ref(&event)) {
                    warn!(error = %e, seq = event.seq, "state cache not updated, will catch up later");
                }
            }
            Err(DevsyncError::DbBusy(_)) => {
                debug!(seq = event.seq, "state cache busy, deferring apply");
            }
            Err(e) => {
                warn!(error = %e, seq = event.seq, "state cache unavailable, will catch up later");
            }
        }
        Ok(event)
    }

    /// Current state, caught up with everything in the log
    pub fn state(&self) -> Result<MaterializedState, DevsyncError> {
        let store = self.open_store()?;
        let (_, state) = ReplayEngine::new(&self.log, &store).catch_up()?;
        Ok(state)
    }

    pub fn catch_up(&self) -> Result<CatchUpReport, DevsyncError> {
        let store = self.open_store()?;
        let (report, _) = ReplayEngine::new(&self.log, &store).catch_up()?;
        Ok(report)
    }

    /// Fold events just merged from a remote into the cache
    pub fn apply_merged(&self, events: &[Event]) -> Result<CatchUpReport, DevsyncError> {
        let store = self.open_store()?;
        let (report, _) = ReplayEngine::new(&self.log, &store).apply_new(events)?;
        Ok(report)
    }

    pub fn rebuild(&self) -> Result<RebuildReport, DevsyncError> {
        let store = self.open_store()?;
        let (report, _) = ReplayEngine::new(&self.log, &store).rebuild()?;
        Ok(report)
    }

    pub fn verify(&self) -> Result<VerifyReport, DevsyncError> {
        let store = self.open_store()?;
        ReplayEngine::new(&self.log, &store).verify()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempdir().unwrap();
        let first = Replica::init(dir.path(), Some("laptop".to_string()), None).unwrap();
        let again = Replica::init(dir.path(), None, None).unwrap();
        assert_eq!(first.device_id(), again.device_id());

        let err = Replica::init(dir.path(), Some("phone".to_string()), None).unwrap_err();
        assert!(matches!(err, DevsyncError::InvalidArgs(_)));
    }

    #[test]
    fn test_explicit_id_marks_restore_pending() {
        let dir = tempdir().unwrap();
        let named = Replica::init(&dir.path().join("named"), Some("laptop".to_string()), None).unwrap();
        assert!(named.restore_pending().unwrap());
        named.finish_restore().unwrap();
        assert!(!named.restore_pending().unwrap());
        assert!(!Replica::open(&dir.path().join("named")).unwrap().restore_pending().unwrap());

        let generated = Replica::init(&dir.path().join("generated"), None, None).unwrap();
        assert!(!generated.restore_pending().unwrap());
    }

    #[test]
    fn test_open_requires_init() {
        let dir = tempdir().unwrap();
        assert!(matches!(Replica::open(dir.path()), Err(DevsyncError::NotFound(_))));
    }

    #[test]
    fn test_record_updates_state() {
        let dir = tempdir().unwrap();
        let replica = Replica::init(dir.path(), Some("laptop".to_string()), None).unwrap();
        replica
            .record(EventKind::AddProject {
                path: "/src/app".to_string(),
                repo_url: None,
                device: None,
            })
            .unwrap();

        let state = replica.state().unwrap();
        assert_eq!(state.live_project_count(), 1);
        assert_eq!(state.frontier.get("laptop"), Some(&1));
    }

    #[test]
    fn test_record_defers_when_cache_busy() {
        let dir = tempdir().unwrap();
        let replica = Replica::init(dir.path(), Some("laptop".to_string()), None).unwrap();

        let held = replica.open_store().unwrap();
        let event = replica
            .record(EventKind::SetConfig {
                key: "editor".to_string(),
                value: "helix".to_string(),
            })
            .unwrap();
        assert_eq!(event.seq, 1);
        assert!(held.load_state().unwrap().is_none());
        drop(held);

        let state = replica.state().unwrap();
        assert_eq!(state.config.get("editor").map(String::as_str), Some("helix"));
    }
}
