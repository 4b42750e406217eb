use std::collections::BTreeMap;

use libdevsync_core::log::{scan_segment, SegmentCorruption};
use libdevsync_core::types::ids::{validate_device_id, DeviceId};
use libdevsync_core::Event;

use crate::error::SyncError;

/// One device's segment as read from a remote
#[derive(Debug, Clone)]
pub struct RemoteSegment {
    pub device_id: DeviceId,
    /// Events newer than the requested frontier (empty when corrupt)
    pub events: Vec<Event>,
    pub corruption: Option<SegmentCorruption>,
    /// Full segment bytes, kept only when corrupt so they can be quarantined
    pub raw: Vec<u8>,
}

impl RemoteSegment {
    /// Parse raw segment bytes, keeping events with seq above `floor`
    pub fn parse(device_id: &str, bytes: Vec<u8>, floor: u64) -> Self {
        let scan = scan_segment(&bytes, device_id);
        match scan.corruption {
            Some(corruption) => Self {
                device_id: device_id.to_string(),
                events: Vec::new(),
                corruption: Some(corruption),
                raw: bytes,
            },
            None => Self {
                device_id: device_id.to_string(),
                events: scan.events.into_iter().filter(|e| e.seq > floor).collect(),
                corruption: None,
                raw: Vec::new(),
            },
        }
    }

    pub fn is_corrupt(&self) -> bool {
        self.corruption.is_some()
    }
}

/// A shared place where every device publishes its segment.
///
/// Each device only ever appends to its own segment, so the only contention
/// a remote sees is between different devices updating the remote as a whole.
pub trait Remote {
    /// Human-readable location, for logs and `remote show`
    fn describe(&self) -> String;

    /// Every event the remote holds for `device`, in seq order. A corrupt
    /// remote copy is an error.
    fn fetch_segment(&mut self, device: &str) -> Result<Vec<Event>, SyncError>;

    /// Append events to `device`'s remote segment. Events at or below the
    /// current remote head are dropped. Returns the new remote head.
    ///
    /// Fails with `SyncError::Conflict` if another device updated the remote
    /// concurrently; the caller pulls and retries.
    fn append_segment(&mut self, device: &str, events: &[Event]) -> Result<u64, SyncError>;

    /// Fetch every segment, keeping only events above `since[device]`
    fn fetch_segments(&mut self, since: &BTreeMap<DeviceId, u64>) -> Result<Vec<RemoteSegment>, SyncError>;
}

impl<R: Remote + ?Sized> Remote for Box<R> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn fetch_segment(&mut self, device: &str) -> Result<Vec<Event>, SyncError> {
        (**self).fetch_segment(device)
    }

    fn append_segment(&mut self, device: &str, events: &[Event]) -> Result<u64, SyncError> {
        (**self).append_segment(device, events)
    }

    fn fetch_segments(
        &mut self,
        since: &BTreeMap<DeviceId, u64>,
    ) -> Result<Vec<RemoteSegment>, SyncError> {
        (**self).fetch_segments(since)
    }
}

/// Device id encoded in a segment file name, if it is one
pub(crate) fn segment_device(file_name: &str) -> Option<&str> {
    let device = file_name.strip_suffix(".log")?;
    validate_device_id(device).ok()?;
    Some(device)
}

/// Serialize events as segment lines
pub(crate) fn encode_lines(events: &[Event]) -> Result<Vec<u8>, SyncError> {
    let mut buf = Vec::new();
    for event in events {
        buf.extend_from_slice(event.to_line()?.as_bytes());
        buf.push(b'\n');
    }
    Ok(buf)
}
