//! Integrity checking for the event log
//!
//! Walks every segment and reports corruption, sequence gaps, undecodable
//! kinds and torn tails without modifying anything.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::DevsyncError;
use crate::log::EventLog;
use crate::types::ids::DeviceId;

/// Result of an integrity check
#[derive(Debug, Default, Serialize)]
pub struct IntegrityReport {
    /// Total events checked
    pub events_checked: usize,
    /// Segments scanned
    pub segments: usize,
    /// Segments that fail to parse or break the per-device ordering rules
    pub corrupt_segments: Vec<SegmentIssue>,
    /// Missing seq ranges, as `(device, first missing, next present)`
    pub seq_gaps: Vec<SeqGap>,
    /// Count of events per kind this build does not understand
    pub unknown_kinds: BTreeMap<String, usize>,
    /// Segments ending in an incomplete line
    pub torn_tails: Vec<DeviceId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentIssue {
    pub device_id: DeviceId,
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeqGap {
    pub device_id: DeviceId,
    pub missing_from: u64,
    pub resumes_at: u64,
}

impl IntegrityReport {
    /// Check if the report indicates all is well
    pub fn is_healthy(&self) -> bool {
        self.corrupt_segments.is_empty()
    }

    /// Whether anything short of corruption deserves attention
    pub fn has_warnings(&self) -> bool {
        !self.seq_gaps.is_empty() || !self.unknown_kinds.is_empty() || !self.torn_tails.is_empty()
    }

    pub fn corruption_count(&self) -> usize {
        self.corrupt_segments.len()
    }
}

/// Check integrity of every segment in the log
pub fn check_log(log: &EventLog) -> Result<IntegrityReport, DevsyncError> {
    let mut report = IntegrityReport::default();

    for device_id in log.devices()? {
        let scan = log.read_segment(&device_id)?;
        report.segments += 1;

        if scan.torn_tail {
            report.torn_tails.push(device_id.clone());
        }
        if let Some(corruption) = scan.corruption {
            report.corrupt_segments.push(SegmentIssue {
                device_id,
                line: corruption.line,
                reason: corruption.reason,
            });
            continue;
        }

        let mut expected = 1;
        for event in &scan.events {
            report.events_checked += 1;
            if event.seq != expected {
                report.seq_gaps.push(SeqGap {
                    device_id: device_id.clone(),
                    missing_from: expected,
                    resumes_at: event.seq,
                });
            }
            expected = event.seq + 1;

            if event.kind.is_unknown() {
                *report.unknown_kinds.entry(event.kind.name().to_string()).or_default() += 1;
            }
        }
    }

    Ok(report)
}
