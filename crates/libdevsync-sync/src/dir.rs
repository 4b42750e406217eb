//! Remote backed by a shared directory
//!
//! Works with anything that presents the remote as a mounted path: a
//! cloud-synced folder, an rclone mount, a network share. Layout is
//! `<root>/events/<device_id>.log`.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use libdevsync_core::log::scan_segment;
use libdevsync_core::types::ids::DeviceId;
use libdevsync_core::Event;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::remote::{encode_lines, segment_device, Remote, RemoteSegment};

pub struct DirRemote {
    root: PathBuf,
    lock_timeout: Duration,
}

impl DirRemote {
    pub fn new(root: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            lock_timeout,
        }
    }

    fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }

    fn segment_path(&self, device: &str) -> PathBuf {
        self.events_dir().join(format!("{}.log", device))
    }

    fn ensure_reachable(&self) -> Result<(), SyncError> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(SyncError::Unreachable(format!(
                "remote directory {} is not available",
                self.root.display()
            )))
        }
    }

    fn read_segment(&self, device: &str) -> Result<Vec<u8>, SyncError> {
        match std::fs::read(self.segment_path(device)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(unreachable(&self.segment_path(device), e)),
        }
    }

    fn lock_segment(&self, path: &Path) -> Result<File, SyncError> {
        let lock_path = path.with_extension("log.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| unreachable(&lock_path, e))?;

        let start = Instant::now();
        let mut delay = Duration::from_millis(10);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(file),
                Err(_) if start.elapsed() < self.lock_timeout => {
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(200));
                }
                Err(e) => {
                    return Err(SyncError::Unreachable(format!(
                        "timeout waiting for remote segment lock {}: {}",
                        lock_path.display(),
                        e
                    )))
                }
            }
        }
    }
}

impl Remote for DirRemote {
    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }

    fn fetch_segment(&mut self, device: &str) -> Result<Vec<Event>, SyncError> {
        self.ensure_reachable()?;
        let scan = scan_segment(&self.read_segment(device)?, device);
        if let Some(corruption) = scan.corruption {
            return Err(SyncError::CorruptSegment {
                device: device.to_string(),
                reason: corruption.reason,
            });
        }
        Ok(scan.events)
    }

    fn append_segment(&mut self, device: &str, events: &[Event]) -> Result<u64, SyncError> {
        self.ensure_reachable()?;
        std::fs::create_dir_all(self.events_dir()).map_err(|e| unreachable(&self.events_dir(), e))?;

        let path = self.segment_path(device);
        let _lock = self.lock_segment(&path)?;

        let bytes = self.read_segment(device)?;
        let scan = scan_segment(&bytes, device);
        if let Some(corruption) = scan.corruption {
            return Err(SyncError::CorruptSegment {
                device: device.to_string(),
                reason: corruption.reason,
            });
        }

        let head = scan.last_seq();
        let fresh: Vec<Event> = events.iter().filter(|e| e.seq > head).cloned().collect();
        let Some(last) = fresh.last() else {
            return Ok(head);
        };
        let new_head = last.seq;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| unreachable(&path, e))?;
        if scan.torn_tail {
            warn!(path = %path.display(), "truncating torn tail of remote segment");
            file.set_len(scan.complete_len as u64).map_err(|e| unreachable(&path, e))?;
        }
        file.write_all(&encode_lines(&fresh)?).map_err(|e| unreachable(&path, e))?;
        file.sync_all().map_err(|e| unreachable(&path, e))?;

        debug!(device = %device, count = fresh.len(), head = new_head, "appended to remote segment");
        Ok(new_head)
    }

    fn fetch_segments(&mut self, since: &BTreeMap<DeviceId, u64>) -> Result<Vec<RemoteSegment>, SyncError> {
        self.ensure_reachable()?;
        let dir = self.events_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| unreachable(&dir, e))? {
            let entry = entry.map_err(|e| unreachable(&dir, e))?;
            let name = entry.file_name();
            let Some(device) = name.to_str().and_then(segment_device) else {
                continue;
            };
            let floor = since.get(device).copied().unwrap_or(0);
            let bytes = self.read_segment(device)?;
            segments.push(RemoteSegment::parse(device, bytes, floor));
        }
        segments.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(segments)
    }
}

fn unreachable(path: &Path, err: std::io::Error) -> SyncError {
    SyncError::Unreachable(format!("{}: {}", path.display(), err))
}
