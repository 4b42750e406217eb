//! Local record of how far this device has synced.
//!
//! Purely an optimization: every entry can be lost and the next pull simply
//! refetches, with duplicates dropped by the event log.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::DevsyncError;
use crate::store::{read_u64, StateStore};
use crate::types::device::DeviceRecord;
use crate::types::ids::DeviceId;

const SYNCED_PREFIX: &str = "synced/";
const PUSHED_KEY: &str = "pushed";

/// Sync bookkeeping kept in the state store's `registry` tree
pub struct DeviceRegistry<'a> {
    device_id: DeviceId,
    tree: &'a sled::Tree,
}

impl<'a> DeviceRegistry<'a> {
    pub fn new(store: &'a StateStore, device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            tree: store.registry_tree(),
        }
    }

    pub fn current_device(&self) -> &str {
        &self.device_id
    }

    /// Remember that everything up to `seq` from `device` has been pulled.
    /// Never moves backwards.
    pub fn record_sync(&self, device: &str, seq: u64) -> Result<(), DevsyncError> {
        let key = format!("{}{}", SYNCED_PREFIX, device);
        let current = read_u64(self.tree, &key)?.unwrap_or(0);
        if seq > current {
            self.tree.insert(key.as_bytes(), &seq.to_le_bytes())?;
            debug!(device = %device, seq, "recorded sync");
        }
        Ok(())
    }

    pub fn last_synced(&self, device: &str) -> Result<u64, DevsyncError> {
        Ok(read_u64(self.tree, &format!("{}{}", SYNCED_PREFIX, device))?.unwrap_or(0))
    }

    /// All remote devices pulled so far
    pub fn synced_frontier(&self) -> Result<BTreeMap<DeviceId, u64>, DevsyncError> {
        let mut frontier = BTreeMap::new();
        for entry in self.tree.scan_prefix(SYNCED_PREFIX) {
            let (key, value) = entry?;
            let device = String::from_utf8_lossy(&key[SYNCED_PREFIX.len()..]).to_string();
            let arr: [u8; 8] = value.as_ref().try_into().unwrap_or([0; 8]);
            frontier.insert(device, u64::from_le_bytes(arr));
        }
        Ok(frontier)
    }

    /// Remember that own events up to `seq` are on the remote
    pub fn record_push(&self, seq: u64) -> Result<(), DevsyncError> {
        if seq > self.last_pushed()? {
            self.tree.insert(PUSHED_KEY, &seq.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn last_pushed(&self) -> Result<u64, DevsyncError> {
        Ok(read_u64(self.tree, PUSHED_KEY)?.unwrap_or(0))
    }

    pub fn record(&self) -> Result<DeviceRecord, DevsyncError> {
        Ok(DeviceRecord {
            device_id: self.device_id.clone(),
            last_synced: self.synced_frontier()?,
            last_pushed: self.last_pushed()?,
        })
    }
}
