use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::{generate_device_id, DeviceId};

/// Per-device configuration stored in `<data_dir>/device.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device ID (stable once written)
    pub device_id: DeviceId,
    /// Human-friendly label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Creation timestamp in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_ts: Option<u64>,
    /// Set when the id was chosen by hand: the remote may already hold
    /// events for it, and they must be taken over before the first push.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub restore_pending: bool,
}

impl DeviceConfig {
    /// Create a config for a new device, generating an id when none is given
    pub fn new(device_id: Option<DeviceId>, label: Option<String>) -> Self {
        Self {
            restore_pending: device_id.is_some(),
            device_id: device_id.unwrap_or_else(generate_device_id),
            label,
            created_ts: Some(chrono::Utc::now().timestamp_millis().max(0) as u64),
        }
    }
}

/// Local sync bookkeeping for one device. Never synced itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    /// Highest seq pulled per remote device
    pub last_synced: BTreeMap<DeviceId, u64>,
    /// Highest own seq known to be on the remote
    pub last_pushed: u64,
}
