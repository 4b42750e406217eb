use std::fs::File;
use std::path::Path;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::Serialize;
use tracing::warn;

use crate::config::RebuildPolicy;
use crate::error::DevsyncError;
use crate::types::state::MaterializedState;

/// Default threshold for events since rebuild before recommending rebuild
pub const DEFAULT_REBUILD_EVENTS_THRESHOLD: u64 = 10000;

/// Default threshold for days since rebuild before recommending rebuild
pub const DEFAULT_REBUILD_DAYS_THRESHOLD: u32 = 7;

const STATE_KEY: &str = "current";
const EVENTS_SINCE_REBUILD: &str = "events_since_rebuild";
const LAST_REBUILD_TS: &str = "last_rebuild_ts";

/// Statistics about the state cache
#[derive(Debug, Serialize)]
pub struct DbStats {
    pub path: String,
    pub size_bytes: u64,
    /// Events folded into the cached state
    pub applied_events: u64,
    pub live_projects: usize,
    pub commands: usize,
    pub config_keys: usize,
    /// Devices with at least one applied event
    pub devices: usize,
    pub skipped_events: u64,
    pub last_rebuild_ts: Option<u64>,
    /// Events applied since last rebuild
    pub events_since_rebuild: u64,
    /// Days since last rebuild
    pub days_since_rebuild: Option<u32>,
    /// Whether rebuild is recommended based on thresholds
    pub rebuild_recommended: bool,
}

/// A StateStore with filesystem-level exclusive lock.
///
/// The lock is held for the lifetime of this struct and automatically
/// released when dropped. This prevents multiple processes from opening
/// the same sled database concurrently.
pub struct LockedStore {
    /// Lock file handle - flock released on drop
    _lock_file: File,
    store: StateStore,
}

impl std::fmt::Debug for LockedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedStore")
            .field("store", &"StateStore { ... }")
            .finish()
    }
}

impl LockedStore {
    pub fn inner(&self) -> &StateStore {
        &self.store
    }
}

impl std::ops::Deref for LockedStore {
    type Target = StateStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Disposable sled cache of the materialized state plus local sync bookkeeping
pub struct StateStore {
    db: sled::Db,
    state: sled::Tree,
    metadata: sled::Tree,
    registry: sled::Tree,
}

impl StateStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self, DevsyncError> {
        let db = sled::open(path)?;
        let state = db.open_tree("state")?;
        let metadata = db.open_tree("metadata")?;
        let registry = db.open_tree("registry")?;
        Ok(Self {
            db,
            state,
            metadata,
            registry,
        })
    }

    /// Open store with exclusive filesystem lock (non-blocking).
    ///
    /// Lock file is created at `<path>.lock` (e.g., `<data_dir>/state.lock`).
    /// Returns `DevsyncError::DbBusy` if another process holds the lock.
    pub fn open_locked(path: &Path) -> Result<LockedStore, DevsyncError> {
        let lock_path = path.with_extension("lock");
        let lock_file = File::create(&lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|e| DevsyncError::database_locked(Some(&e.to_string())))?;

        let store = Self::open(path)?;
        Ok(LockedStore {
            _lock_file: lock_file,
            store,
        })
    }

    /// Open store with exclusive filesystem lock (blocking with timeout).
    ///
    /// Retries with exponential backoff until the lock is acquired or timeout is reached.
    pub fn open_locked_blocking(path: &Path, timeout: Duration) -> Result<LockedStore, DevsyncError> {
        let lock_path = path.with_extension("lock");
        let lock_file = File::create(&lock_path)?;

        let start = Instant::now();
        let mut delay = Duration::from_millis(10);

        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if start.elapsed() < timeout => {
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(200));
                }
                Err(e) => {
                    return Err(DevsyncError::DbBusy(format!(
                        "Timeout waiting for database lock: {}",
                        e
                    )))
                }
            }
        }

        let store = Self::open(path)?;
        Ok(LockedStore {
            _lock_file: lock_file,
            store,
        })
    }

    /// Load the cached state. A cache written by an incompatible build is
    /// treated as missing.
    pub fn load_state(&self) -> Result<Option<MaterializedState>, DevsyncError> {
        let Some(bytes) = self.state.get(STATE_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(error = %e, "discarding unreadable state cache");
                Ok(None)
            }
        }
    }

    /// Persist the state and count the events applied since the last save
    pub fn save_state(&self, state: &MaterializedState, newly_applied: u64) -> Result<(), DevsyncError> {
        let bytes = serde_json::to_vec(state)?;
        self.state.insert(STATE_KEY, bytes)?;
        if newly_applied > 0 {
            let current = read_u64(&self.metadata, EVENTS_SINCE_REBUILD)?.unwrap_or(0);
            self.metadata
                .insert(EVENTS_SINCE_REBUILD, &(current + newly_applied).to_le_bytes())?;
        }
        self.db.flush()?;
        Ok(())
    }

    /// Drop the cached state
    pub fn clear_state(&self) -> Result<(), DevsyncError> {
        self.state.clear()?;
        self.db.flush()?;
        Ok(())
    }

    /// Reset rebuild counters after a full rebuild
    pub fn mark_rebuilt(&self) -> Result<(), DevsyncError> {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.metadata.insert(LAST_REBUILD_TS, &now.to_le_bytes())?;
        self.metadata.insert(EVENTS_SINCE_REBUILD, &0u64.to_le_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn last_rebuild_ts(&self) -> Result<Option<u64>, DevsyncError> {
        read_u64(&self.metadata, LAST_REBUILD_TS)
    }

    /// Tree holding the local device registry
    pub(crate) fn registry_tree(&self) -> &sled::Tree {
        &self.registry
    }

    /// Get cache statistics
    pub fn stats(&self, path: &Path, policy: &RebuildPolicy) -> Result<DbStats, DevsyncError> {
        let state = self.load_state()?.unwrap_or_default();
        let size_bytes = dir_size(path).unwrap_or(0);
        let applied_events = state.applied_count();

        let last_rebuild_ts = self.last_rebuild_ts()?;
        // Never rebuilt: everything counts as since-rebuild
        let events_since_rebuild = read_u64(&self.metadata, EVENTS_SINCE_REBUILD)?.unwrap_or(applied_events);

        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let days_since_rebuild = last_rebuild_ts.map(|ts| {
            let ms_diff = now_ms.saturating_sub(ts);
            (ms_diff / (24 * 60 * 60 * 1000)) as u32
        });

        let max_events = policy.max_events.unwrap_or(DEFAULT_REBUILD_EVENTS_THRESHOLD);
        let max_days = policy.max_age_days.unwrap_or(DEFAULT_REBUILD_DAYS_THRESHOLD);
        let rebuild_recommended = events_since_rebuild > max_events
            || days_since_rebuild.map(|d| d > max_days).unwrap_or(false);

        Ok(DbStats {
            path: path.to_string_lossy().to_string(),
            size_bytes,
            applied_events,
            live_projects: state.live_project_count(),
            commands: state.commands.len(),
            config_keys: state.config.len(),
            devices: state.frontier.len(),
            skipped_events: state.skipped,
            last_rebuild_ts,
            events_since_rebuild,
            days_since_rebuild,
            rebuild_recommended,
        })
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), DevsyncError> {
        self.db.flush()?;
        Ok(())
    }
}

pub(crate) fn read_u64(tree: &sled::Tree, key: &str) -> Result<Option<u64>, DevsyncError> {
    Ok(tree.get(key)?.map(|bytes| {
        let arr: [u8; 8] = bytes.as_ref().try_into().unwrap_or([0; 8]);
        u64::from_le_bytes(arr)
    }))
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut size = 0;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                size += dir_size(&entry.path())?;
            } else {
                size += meta.len();
            }
        }
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> MaterializedState {
        let mut state = MaterializedState::default();
        state.config.insert("editor".to_string(), "vim".to_string());
        state.frontier.insert("dev1".to_string(), 3);
        state
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("state")).unwrap();
        assert!(store.load_state().unwrap().is_none());

        let state = sample_state();
        store.save_state(&state, 3).unwrap();
        assert_eq!(store.load_state().unwrap(), Some(state));

        store.clear_state().unwrap();
        assert!(store.load_state().unwrap().is_none());
    }

    #[test]
    fn test_unreadable_cache_is_missing() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("state")).unwrap();
        store.state.insert(STATE_KEY, b"{not json".to_vec()).unwrap();
        assert!(store.load_state().unwrap().is_none());
    }

    #[test]
    fn test_stats_and_rebuild_counters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        let store = StateStore::open(&path).unwrap();
        store.save_state(&sample_state(), 3).unwrap();

        let policy = RebuildPolicy {
            max_events: Some(2),
            max_age_days: None,
        };
        let stats = store.stats(&path, &policy).unwrap();
        assert_eq!(stats.applied_events, 3);
        assert_eq!(stats.config_keys, 1);
        assert_eq!(stats.events_since_rebuild, 3);
        assert!(stats.rebuild_recommended);

        store.mark_rebuilt().unwrap();
        let stats = store.stats(&path, &policy).unwrap();
        assert_eq!(stats.events_since_rebuild, 0);
        assert_eq!(stats.days_since_rebuild, Some(0));
        assert!(!stats.rebuild_recommended);
    }

    #[test]
    fn test_open_locked_rejects_second_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        let _held = StateStore::open_locked(&path).unwrap();

        let err = StateStore::open_locked(&path).unwrap_err();
        assert!(matches!(err, DevsyncError::DbBusy(_)));

        let err = StateStore::open_locked_blocking(&path, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, DevsyncError::DbBusy(_)));
    }
}
