//! Append-only, device-tagged event log
//!
//! The log is a directory of segments, one per device:
//! `<data_dir>/events/<device_id>.log`. The local device appends to its own
//! segment; events merged from other devices are appended to theirs. Writers
//! serialize on `<data_dir>/events.lock`, readers take no lock and simply
//! ignore a torn final line.

pub mod segment;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::config::{quarantine_dir, segments_dir};
use crate::error::DevsyncError;
use crate::hash::content_digest;
use crate::types::event::{sort_canonical, Event, EventKind};
use crate::types::ids::{validate_device_id, DeviceId};

pub use segment::{scan_segment, SegmentCorruption, SegmentScan};

/// File extension of segment files
pub const SEGMENT_EXT: &str = "log";

/// Default time to wait for the log lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of reading the whole log
#[derive(Debug, Default)]
pub struct LogRead {
    /// Events of all healthy segments, in canonical order
    pub events: Vec<Event>,
    /// Segments excluded because they are corrupt
    pub corrupt: Vec<CorruptSegment>,
}

/// A segment excluded from reads
#[derive(Debug, Clone)]
pub struct CorruptSegment {
    pub device_id: DeviceId,
    pub corruption: SegmentCorruption,
}

/// Outcome of merging foreign events
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Events newly written to the log
    pub applied: usize,
    /// Events already present (seq at or below the device's max)
    pub duplicates: usize,
    /// Events refused as invalid for their segment
    pub rejected: usize,
    /// The newly written events, in canonical order
    pub accepted: Vec<Event>,
    /// Devices whose local segment is corrupt, so nothing was merged for them
    pub skipped_segments: Vec<DeviceId>,
}

/// Outcome of reconciling the local device's segment with a remote copy
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// Own events taken over from the remote copy
    pub adopted: usize,
    /// Local events renumbered to follow the adopted ones
    pub rebased: usize,
}

impl RestoreReport {
    pub fn changed(&self) -> bool {
        self.adopted > 0 || self.rebased > 0
    }
}

/// Exclusive writer lock on the log, released on drop
struct LogLock {
    _file: File,
}

impl LogLock {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self, DevsyncError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| DevsyncError::local_write("opening log lock", e))?;

        let start = Instant::now();
        let mut delay = Duration::from_millis(5);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { _file: file }),
                Err(_) if start.elapsed() < timeout => {
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(200));
                }
                Err(e) => {
                    return Err(DevsyncError::DbBusy(format!(
                        "timeout waiting for event log lock: {}",
                        e
                    )))
                }
            }
        }
    }
}

/// The event log of one local data directory
#[derive(Debug, Clone)]
pub struct EventLog {
    data_dir: PathBuf,
    segments: PathBuf,
    device_id: DeviceId,
    lock_timeout: Duration,
}

impl EventLog {
    /// Open (creating if needed) the log for `device_id` under `data_dir`
    pub fn open(data_dir: &Path, device_id: &str) -> Result<Self, DevsyncError> {
        validate_device_id(device_id)?;
        let segments = segments_dir(data_dir);
        std::fs::create_dir_all(&segments)
            .map_err(|e| DevsyncError::local_write("creating segments directory", e))?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            segments,
            device_id: device_id.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// The local device this log appends for
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn segment_path(&self, device_id: &str) -> PathBuf {
        self.segments.join(format!("{}.{}", device_id, SEGMENT_EXT))
    }

    fn lock(&self) -> Result<LogLock, DevsyncError> {
        LogLock::acquire(&self.data_dir.join("events.lock"), self.lock_timeout)
    }

    /// Record a mutation from the local device, stamped with the current time
    pub fn append(&self, kind: EventKind) -> Result<Event, DevsyncError> {
        self.append_at(kind, Utc::now())
    }

    /// Record a mutation with an explicit clock reading.
    ///
    /// Assigns the next seq and clamps `wall_time` so it never precedes the
    /// previous local event. The line is fsynced before this returns.
    pub fn append_at(&self, kind: EventKind, wall_time: DateTime<Utc>) -> Result<Event, DevsyncError> {
        let _lock = self.lock()?;
        let path = self.segment_path(&self.device_id);
        let scan = self.read_segment_bytes(&self.device_id)?;
        let scan = scan_segment(&scan, &self.device_id);

        if let Some(corruption) = scan.corruption {
            return Err(DevsyncError::CorruptSegment {
                device: self.device_id.clone(),
                reason: format!("line {}: {}", corruption.line, corruption.reason),
            });
        }

        let wall_time = match scan.last_wall_time() {
            Some(last) if wall_time <= last => last + chrono::Duration::microseconds(1),
            _ => wall_time,
        };
        let event = Event::new(self.device_id.clone(), scan.last_seq() + 1, wall_time, kind);

        let mut line = event.to_line()?;
        line.push('\n');
        append_durably(&path, scan.torn_tail.then_some(scan.complete_len), line.as_bytes())?;

        debug!(device = %event.device_id, seq = event.seq, kind = event.kind.name(), "appended event");
        Ok(event)
    }

    /// Raw bytes of a device's segment (empty if absent)
    fn read_segment_bytes(&self, device_id: &str) -> Result<Vec<u8>, DevsyncError> {
        match std::fs::read(self.segment_path(device_id)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Scan one device's segment
    pub fn read_segment(&self, device_id: &str) -> Result<SegmentScan, DevsyncError> {
        let bytes = self.read_segment_bytes(device_id)?;
        Ok(scan_segment(&bytes, device_id))
    }

    /// Devices that have a segment in this log, sorted
    pub fn devices(&self) -> Result<Vec<DeviceId>, DevsyncError> {
        let mut devices = Vec::new();
        for entry in std::fs::read_dir(&self.segments)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_device_id(stem).is_ok() {
                    devices.push(stem.to_string());
                }
            }
        }
        devices.sort();
        Ok(devices)
    }

    /// Read every healthy segment, in canonical order
    pub fn read_all(&self) -> Result<LogRead, DevsyncError> {
        self.read_since(&BTreeMap::new())
    }

    /// Read events with `seq` above `frontier[device]` (all events for
    /// devices missing from the frontier), in canonical order
    pub fn read_since(&self, frontier: &BTreeMap<DeviceId, u64>) -> Result<LogRead, DevsyncError> {
        let mut read = LogRead::default();
        for device_id in self.devices()? {
            let scan = self.read_segment(&device_id)?;
            if let Some(corruption) = scan.corruption {
                warn!(device = %device_id, line = corruption.line, reason = %corruption.reason, "skipping corrupt segment");
                read.corrupt.push(CorruptSegment { device_id, corruption });
                continue;
            }
            let floor = frontier.get(&device_id).copied().unwrap_or(0);
            read.events.extend(scan.events.into_iter().filter(|e| e.seq > floor));
        }
        sort_canonical(&mut read.events);
        Ok(read)
    }

    /// Highest seq per device across healthy segments
    pub fn frontier(&self) -> Result<BTreeMap<DeviceId, u64>, DevsyncError> {
        let mut frontier = BTreeMap::new();
        for device_id in self.devices()? {
            let scan = self.read_segment(&device_id)?;
            if !scan.is_corrupt() && scan.last_seq() > 0 {
                frontier.insert(device_id, scan.last_seq());
            }
        }
        Ok(frontier)
    }

    /// Merge events received from other devices.
    ///
    /// Deduplicates by `(device_id, seq)`: anything at or below the highest
    /// seq already held for that device counts as a duplicate. Accepted
    /// events are appended to their device's segment and fsynced.
    pub fn merge_foreign(&self, events: Vec<Event>) -> Result<MergeReport, DevsyncError> {
        let mut report = MergeReport::default();
        if events.is_empty() {
            return Ok(report);
        }

        let mut by_device: BTreeMap<DeviceId, Vec<Event>> = BTreeMap::new();
        for event in events {
            if let Err(e) = validate_device_id(&event.device_id) {
                warn!(device = %event.device_id, error = %e, "rejecting event with invalid device id");
                report.rejected += 1;
                continue;
            }
            by_device.entry(event.device_id.clone()).or_default().push(event);
        }

        let _lock = self.lock()?;
        for (device_id, mut batch) in by_device {
            batch.sort_by_key(|e| e.seq);

            let bytes = self.read_segment_bytes(&device_id)?;
            let scan = scan_segment(&bytes, &device_id);
            if let Some(corruption) = &scan.corruption {
                warn!(device = %device_id, reason = %corruption.reason, "local segment corrupt, not merging");
                report.rejected += batch.len();
                report.skipped_segments.push(device_id);
                continue;
            }

            let mut last = scan.events.last().cloned();
            let mut accepted = Vec::new();
            for event in batch {
                let last_seq = last.as_ref().map(|e| e.seq).unwrap_or(0);
                if event.seq <= last_seq {
                    report.duplicates += 1;
                    continue;
                }
                if let Some(reason) = segment::check_successor(last.as_ref(), &event, &device_id) {
                    warn!(device = %device_id, seq = event.seq, %reason, "rejecting foreign event");
                    report.rejected += 1;
                    continue;
                }
                if event.seq != last_seq + 1 {
                    warn!(device = %device_id, expected = last_seq + 1, got = event.seq, "gap in foreign segment");
                }
                last = Some(event.clone());
                accepted.push(event);
            }

            if accepted.is_empty() {
                continue;
            }

            let mut buf = String::new();
            for event in &accepted {
                buf.push_str(&event.to_line()?);
                buf.push('\n');
            }
            append_durably(
                &self.segment_path(&device_id),
                scan.torn_tail.then_some(scan.complete_len),
                buf.as_bytes(),
            )?;

            debug!(device = %device_id, count = accepted.len(), "merged foreign events");
            report.applied += accepted.len();
            report.accepted.extend(accepted);
        }

        sort_canonical(&mut report.accepted);
        Ok(report)
    }

    /// Move a device's local segment into the quarantine directory.
    /// Returns the new location.
    pub fn quarantine(&self, device_id: &str) -> Result<PathBuf, DevsyncError> {
        validate_device_id(device_id)?;
        let _lock = self.lock()?;
        let source = self.segment_path(device_id);
        if !source.exists() {
            return Err(DevsyncError::NotFound(format!("segment for device {}", device_id)));
        }
        let target = self.quarantine_target(device_id, "local")?;
        std::fs::rename(&source, &target)?;
        warn!(device = %device_id, path = %target.display(), "quarantined segment");
        Ok(target)
    }

    /// Keep a copy of corrupt segment bytes received from a remote.
    ///
    /// The file is named after the content digest, so the same bytes pulled
    /// again land on the existing copy.
    pub fn quarantine_bytes(&self, device_id: &str, raw: &[u8]) -> Result<PathBuf, DevsyncError> {
        validate_device_id(device_id)?;
        let dir = quarantine_dir(&self.data_dir);
        std::fs::create_dir_all(&dir)?;
        let digest = content_digest(raw);
        let target = dir.join(format!("{}-remote-{}.{}", device_id, &digest[..16], SEGMENT_EXT));
        if target.exists() {
            debug!(device = %device_id, path = %target.display(), "remote segment already quarantined");
            return Ok(target);
        }
        std::fs::write(&target, raw)?;
        Ok(target)
    }

    /// Take over the events a remote holds for the local device.
    ///
    /// Used when a device id is reused in a fresh data directory: `published`
    /// is what the remote has for this device. Local events that differ from
    /// it have never left this directory, so they are renumbered to follow
    /// the published ones. A no-op once the local segment starts with
    /// `published`.
    pub fn restore_own(&self, published: &[Event]) -> Result<RestoreReport, DevsyncError> {
        let mut prev: Option<&Event> = None;
        for event in published {
            if let Some(reason) = segment::check_successor(prev, event, &self.device_id) {
                return Err(DevsyncError::CorruptSegment {
                    device: self.device_id.clone(),
                    reason: format!("remote copy: {}", reason),
                });
            }
            prev = Some(event);
        }

        let _lock = self.lock()?;
        let path = self.segment_path(&self.device_id);
        let scan = scan_segment(&self.read_segment_bytes(&self.device_id)?, &self.device_id);
        if let Some(corruption) = scan.corruption {
            return Err(DevsyncError::CorruptSegment {
                device: self.device_id.clone(),
                reason: format!("line {}: {}", corruption.line, corruption.reason),
            });
        }

        let shared = scan.events.iter().zip(published).take_while(|(local, remote)| local == remote).count();
        if shared == published.len() {
            return Ok(RestoreReport::default());
        }

        let mut events = published.to_vec();
        let unpublished = &scan.events[shared..];
        for event in unpublished {
            let mut moved = event.clone();
            if let Some(last) = events.last() {
                moved.seq = last.seq + 1;
                if moved.wall_time <= last.wall_time {
                    moved.wall_time = last.wall_time + chrono::Duration::microseconds(1);
                }
            }
            events.push(moved);
        }
        rewrite_durably(&path, &events)?;

        let report = RestoreReport {
            adopted: published.len() - shared,
            rebased: unpublished.len(),
        };
        info!(device = %self.device_id, adopted = report.adopted, rebased = report.rebased, "restored own segment");
        Ok(report)
    }

    fn quarantine_target(&self, device_id: &str, origin: &str) -> Result<PathBuf, DevsyncError> {
        let dir = quarantine_dir(&self.data_dir);
        std::fs::create_dir_all(&dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        Ok(dir.join(format!("{}-{}-{}.{}", device_id, origin, stamp, SEGMENT_EXT)))
    }
}

/// Append bytes to a segment and fsync. When `truncate_to` is set, a torn
/// tail left by a crashed writer is cut off first.
fn append_durably(path: &Path, truncate_to: Option<usize>, data: &[u8]) -> Result<(), DevsyncError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DevsyncError::local_write(format!("opening {}", path.display()), e))?;

    if let Some(len) = truncate_to {
        warn!(path = %path.display(), "truncating torn tail");
        file.set_len(len as u64)
            .map_err(|e| DevsyncError::local_write("truncating torn tail", e))?;
    }

    file.write_all(data)
        .map_err(|e| DevsyncError::local_write(format!("writing {}", path.display()), e))?;
    file.sync_all()
        .map_err(|e| DevsyncError::local_write(format!("syncing {}", path.display()), e))?;
    Ok(())
}

/// Replace a segment with `events`: write a sibling file, fsync, rename
fn rewrite_durably(path: &Path, events: &[Event]) -> Result<(), DevsyncError> {
    let mut buf = String::new();
    for event in events {
        buf.push_str(&event.to_line()?);
        buf.push('\n');
    }

    let staging = path.with_extension("log.tmp");
    let mut file = File::create(&staging)
        .map_err(|e| DevsyncError::local_write(format!("creating {}", staging.display()), e))?;
    file.write_all(buf.as_bytes())
        .map_err(|e| DevsyncError::local_write(format!("writing {}", staging.display()), e))?;
    file.sync_all()
        .map_err(|e| DevsyncError::local_write(format!("syncing {}", staging.display()), e))?;
    std::fs::rename(&staging, path)
        .map_err(|e| DevsyncError::local_write(format!("replacing {}", path.display()), e))?;
    Ok(())
}
