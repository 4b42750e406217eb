use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DevsyncError;
use crate::types::device::DeviceConfig;
use crate::types::ids::validate_device_id;

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "DEVSYNC_HOME";

/// Workspace configuration stored in `<data_dir>/config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevsyncConfig {
    /// Shared remote the event log syncs through
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,
    /// Push/pull tuning
    #[serde(default)]
    pub sync: SyncSettings,
    /// Rebuild recommendation policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuild: Option<RebuildPolicy>,
}

/// Where the shared event segments live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteConfig {
    /// A shared directory (cloud-synced folder, rclone mount, network share)
    Dir { path: PathBuf },
    /// A git repository every device can push to
    Git {
        url: String,
        #[serde(default = "default_branch")]
        branch: String,
    },
}

fn default_branch() -> String {
    "main".to_string()
}

impl RemoteConfig {
    pub fn describe(&self) -> String {
        match self {
            RemoteConfig::Dir { path } => format!("dir:{}", path.display()),
            RemoteConfig::Git { url, branch } => format!("git:{}#{}", url, branch),
        }
    }
}

/// Retry and timeout settings for push/pull
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Retries after a transient failure or push conflict
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound for a whole push or pull
    pub timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            timeout_secs: 30,
        }
    }
}

/// Thresholds after which `db stats` recommends a rebuild
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_events: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,
}

impl Default for RebuildPolicy {
    fn default() -> Self {
        Self {
            max_events: Some(10_000),
            max_age_days: Some(7),
        }
    }
}

/// Resolve the data directory: explicit flag, then `DEVSYNC_HOME`, then the
/// platform data directory.
pub fn resolve_data_dir(explicit: Option<&Path>) -> Result<PathBuf, DevsyncError> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Ok(home) = std::env::var(DATA_DIR_ENV) {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    directories::ProjectDirs::from("", "", "devsync")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| DevsyncError::NotFound("no home directory to place devsync data in".to_string()))
}

/// Load config from `<data_dir>/config.toml`
pub fn load_config(data_dir: &Path) -> Result<Option<DevsyncConfig>, DevsyncError> {
    let config_path = config_path(data_dir);
    if !config_path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&config_path)?;
    let config: DevsyncConfig = toml::from_str(&content)?;
    Ok(Some(config))
}

/// Save config to `<data_dir>/config.toml`
pub fn save_config(data_dir: &Path, config: &DevsyncConfig) -> Result<(), DevsyncError> {
    std::fs::create_dir_all(data_dir)?;
    let content = toml::to_string_pretty(config)?;
    write_atomic(&config_path(data_dir), content.as_bytes())?;
    Ok(())
}

/// Load device config from `<data_dir>/device.toml`
pub fn load_device_config(data_dir: &Path) -> Result<DeviceConfig, DevsyncError> {
    let path = device_config_path(data_dir);
    if !path.exists() {
        return Err(DevsyncError::NotFound(format!(
            "device config not found: {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(&path)?;
    let config: DeviceConfig = toml::from_str(&content)?;
    validate_device_id(&config.device_id)?;
    Ok(config)
}

/// Save device config to `<data_dir>/device.toml`
pub fn save_device_config(data_dir: &Path, config: &DeviceConfig) -> Result<(), DevsyncError> {
    validate_device_id(&config.device_id)?;
    std::fs::create_dir_all(data_dir)?;
    let content = toml::to_string_pretty(config)?;
    write_atomic(&device_config_path(data_dir), content.as_bytes())?;
    Ok(())
}

/// Write via a temp file and rename so readers never see a partial file
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

pub fn device_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("device.toml")
}

/// Directory holding one segment per device
pub fn segments_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("events")
}

/// Path of the sled state cache
pub fn state_path(data_dir: &Path) -> PathBuf {
    data_dir.join("state")
}

pub fn quarantine_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("quarantine")
}

/// Local cache repository used by the git remote
pub fn remote_cache_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("remote-git")
}
