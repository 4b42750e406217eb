//! Segment line codec
//!
//! A segment is one device's slice of the event log: JSON lines ordered by
//! strictly increasing `seq`, with non-decreasing `wall_time`. A final line
//! without a trailing newline is a torn write and is never surfaced.

use chrono::{DateTime, Utc};

use crate::types::event::Event;

/// Why a segment was judged corrupt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentCorruption {
    /// 1-based line number of the first bad line
    pub line: usize,
    pub reason: String,
}

/// Result of scanning a segment
#[derive(Debug, Clone, Default)]
pub struct SegmentScan {
    /// Valid events in seq order (empty if the segment is corrupt)
    pub events: Vec<Event>,
    /// Bytes covered by complete lines
    pub complete_len: usize,
    /// True when trailing bytes form an incomplete line
    pub torn_tail: bool,
    pub corruption: Option<SegmentCorruption>,
}

impl SegmentScan {
    pub fn is_corrupt(&self) -> bool {
        self.corruption.is_some()
    }

    /// Highest seq in the segment, 0 if empty
    pub fn last_seq(&self) -> u64 {
        self.events.last().map(|e| e.seq).unwrap_or(0)
    }

    pub fn last_wall_time(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.wall_time)
    }
}

/// Parse segment bytes. `device_id` is the device the segment belongs to;
/// records attributed to any other device make the segment corrupt.
pub fn scan_segment(bytes: &[u8], device_id: &str) -> SegmentScan {
    let complete_len = match bytes.iter().rposition(|b| *b == b'\n') {
        Some(pos) => pos + 1,
        None => 0,
    };
    let mut scan = SegmentScan {
        complete_len,
        torn_tail: complete_len < bytes.len(),
        ..Default::default()
    };

    let mut events: Vec<Event> = Vec::new();
    for (index, raw) in bytes[..complete_len].split(|b| *b == b'\n').enumerate() {
        let line_no = index + 1;
        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let event: Event = match serde_json::from_slice(raw) {
            Ok(event) => event,
            Err(e) => {
                scan.corruption = Some(SegmentCorruption {
                    line: line_no,
                    reason: format!("unparseable record: {}", e),
                });
                return scan;
            }
        };
        if let Some(reason) = check_successor(events.last(), &event, device_id) {
            scan.corruption = Some(SegmentCorruption { line: line_no, reason });
            return scan;
        }
        events.push(event);
    }

    scan.events = events;
    scan
}

/// Check that `next` may follow `prev` in `device_id`'s segment.
/// Returns the violation, if any.
pub fn check_successor(prev: Option<&Event>, next: &Event, device_id: &str) -> Option<String> {
    if next.device_id != device_id {
        return Some(format!(
            "record from device {} in segment of {}",
            next.device_id, device_id
        ));
    }
    if next.seq == 0 {
        return Some("seq 0 is not a valid sequence number".to_string());
    }
    if let Some(prev) = prev {
        if next.seq <= prev.seq {
            return Some(format!("seq {} does not follow seq {}", next.seq, prev.seq));
        }
        if next.wall_time < prev.wall_time {
            return Some(format!(
                "wall_time of seq {} precedes seq {}",
                next.seq, prev.seq
            ));
        }
    }
    None
}
