//! Push/pull state machine
//!
//! ```text
//! Idle -> Pushing -> ok ------------------------------> Idle
//!                 -> conflict -> pull -> retry (<= N) -> Idle | fail
//! Idle -> Pulling -> Merging -> Idle
//! ```
//!
//! Network I/O happens with neither the event log lock nor the state cache
//! lock held; both are taken only around the local writes that follow.
//!
//! A device's own events only ever flow local -> remote. The one exception
//! is a data directory set up with an explicit device id: before its first
//! push or pull it takes over whatever the remote already holds for that id.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use libdevsync_core::config::remote_cache_dir;
use libdevsync_core::types::ids::DeviceId;
use libdevsync_core::{DevsyncError, DeviceRegistry, Event, RemoteConfig, ReplayEngine, Replica};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dir::DirRemote;
use crate::error::SyncError;
use crate::git::GitRemote;
use crate::remote::Remote;
use crate::retry::RetryPolicy;

/// Where the transport currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Pushing,
    Pulling,
    Merging,
}

#[derive(Debug, Default, Serialize)]
pub struct PushReport {
    /// Own events sent to the remote
    pub pushed: usize,
    /// Highest own seq on the remote afterwards
    pub remote_head: u64,
    pub attempts: u32,
    /// Rejections resolved by pulling first
    pub conflicts: u32,
}

#[derive(Debug, Default, Serialize)]
pub struct PullReport {
    /// Events received above the local frontier
    pub fetched: usize,
    /// Events newly written to the local log
    pub applied: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// Remote segments saved to quarantine and skipped
    pub quarantined: Vec<DeviceId>,
    /// True when the cache had to be recomputed from the whole log
    pub replayed: bool,
    /// True when the cache was busy; it catches up on next read
    pub cache_deferred: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct SyncReport {
    pub pull: PullReport,
    pub push: PushReport,
}

/// Open the remote configured for a replica
pub fn connect(replica: &Replica) -> Result<Box<dyn Remote>, DevsyncError> {
    let config = replica.config();
    let remote = config
        .remote
        .as_ref()
        .ok_or_else(|| DevsyncError::NotFound("no remote configured".to_string()))?;
    let timeout = Duration::from_secs(config.sync.timeout_secs);

    Ok(match remote {
        RemoteConfig::Dir { path } => Box::new(DirRemote::new(path.clone(), timeout)),
        RemoteConfig::Git { url, branch } => Box::new(GitRemote::open(
            &remote_cache_dir(replica.data_dir()),
            url,
            branch,
            timeout,
        )?),
    })
}

/// Moves events between a replica and a remote
pub struct SyncTransport<'a, R: Remote> {
    replica: &'a Replica,
    remote: R,
    retry: RetryPolicy,
    phase: SyncPhase,
    /// Deadline of the push or pull in progress
    deadline: Option<Instant>,
}

impl<'a, R: Remote> SyncTransport<'a, R> {
    pub fn new(replica: &'a Replica, remote: R) -> Self {
        let retry = RetryPolicy::from(&replica.config().sync);
        Self {
            replica,
            remote,
            retry,
            phase: SyncPhase::Idle,
            deadline: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    fn enter(&mut self, phase: SyncPhase) {
        debug!(from = ?self.phase, to = ?phase, remote = %self.remote.describe(), "sync phase");
        self.phase = phase;
    }

    /// Pull then push
    pub fn sync(&mut self) -> Result<SyncReport, SyncError> {
        let pull = self.pull()?;
        let push = self.push()?;
        Ok(SyncReport { pull, push })
    }

    /// Send own events the remote does not have yet
    pub fn push(&mut self) -> Result<PushReport, SyncError> {
        self.enter(SyncPhase::Pushing);
        self.deadline = self.retry.deadline();
        let result = self.restore_if_pending().and_then(|()| self.push_inner());
        self.enter(SyncPhase::Idle);
        result
    }

    fn push_inner(&mut self) -> Result<PushReport, SyncError> {
        let device = self.replica.device_id().to_string();
        let mut report = PushReport::default();

        loop {
            report.attempts += 1;
            let retry = self.retry.clone();
            let deadline = self.deadline;
            let published = retry.run_until(deadline, "fetch own segment", || self.remote.fetch_segment(&device))?;
            let remote_head = published.last().map_or(0, |e| e.seq);

            let scan = self.replica.log().read_segment(&device)?;
            if let Some(corruption) = scan.corruption {
                return Err(SyncError::Core(DevsyncError::CorruptSegment {
                    device,
                    reason: corruption.reason,
                }));
            }
            if let Some(seq) = first_divergence(&scan.events, &published) {
                warn!(device = %device, seq, "remote holds different events for this device");
                return Err(SyncError::Diverged { device, seq });
            }
            let pending: Vec<_> = scan.events.into_iter().filter(|e| e.seq > remote_head).collect();
            if pending.is_empty() {
                report.remote_head = remote_head;
                break;
            }

            match retry.run_until(deadline, "append", || self.remote.append_segment(&device, &pending)) {
                Ok(head) => {
                    report.pushed = pending.iter().filter(|e| e.seq <= head).count();
                    report.remote_head = head;
                    break;
                }
                Err(SyncError::Conflict(msg)) if report.conflicts < self.retry.max_retries => {
                    report.conflicts += 1;
                    warn!(attempt = report.attempts, %msg, "push rejected, pulling before retry");
                    self.enter(SyncPhase::Pulling);
                    self.pull_inner()?;
                    self.enter(SyncPhase::Pushing);
                }
                Err(SyncError::Conflict(msg)) => {
                    return Err(SyncError::RetriesExhausted {
                        attempts: report.attempts,
                        last: Box::new(SyncError::Conflict(msg)),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        self.record(|registry| registry.record_push(report.remote_head));
        info!(pushed = report.pushed, head = report.remote_head, conflicts = report.conflicts, "push complete");
        Ok(report)
    }

    /// Fetch other devices' events and merge them into the local log
    pub fn pull(&mut self) -> Result<PullReport, SyncError> {
        self.enter(SyncPhase::Pulling);
        self.deadline = self.retry.deadline();
        let result = self.restore_if_pending().and_then(|()| self.pull_inner());
        self.enter(SyncPhase::Idle);
        result
    }

    fn pull_inner(&mut self) -> Result<PullReport, SyncError> {
        let replica = self.replica;
        let log = replica.log();
        let since = self.fetch_frontier()?;

        let retry = self.retry.clone();
        let deadline = self.deadline;
        let segments = retry.run_until(deadline, "fetch", || self.remote.fetch_segments(&since))?;

        self.enter(SyncPhase::Merging);
        let mut report = PullReport::default();
        let mut incoming = Vec::new();
        for segment in segments {
            if segment.device_id == replica.device_id() {
                continue;
            }
            if let Some(corruption) = &segment.corruption {
                let saved = log.quarantine_bytes(&segment.device_id, &segment.raw)?;
                warn!(
                    device = %segment.device_id,
                    line = corruption.line,
                    reason = %corruption.reason,
                    saved = %saved.display(),
                    "remote segment corrupt, quarantined"
                );
                report.quarantined.push(segment.device_id);
                continue;
            }
            incoming.extend(segment.events);
        }
        report.fetched = incoming.len();

        let merged = log.merge_foreign(incoming)?;
        report.applied = merged.applied;
        report.duplicates = merged.duplicates;
        report.rejected = merged.rejected;

        match self.replica.open_store() {
            Ok(store) => {
                let (catch_up, _) = ReplayEngine::new(log, &store).apply_new(&merged.accepted)?;
                report.replayed = catch_up.replayed;

                let registry = DeviceRegistry::new(&store, self.replica.device_id());
                for (device, seq) in log.frontier()? {
                    if device != self.replica.device_id() {
                        registry.record_sync(&device, seq)?;
                    }
                }
            }
            Err(DevsyncError::DbBusy(msg)) => {
                warn!(%msg, "state cache busy, merged events will be applied on next read");
                report.cache_deferred = true;
            }
            Err(e) => return Err(e.into()),
        }

        info!(fetched = report.fetched, applied = report.applied, duplicates = report.duplicates, "pull complete");
        Ok(report)
    }

    /// Take over the events the remote already holds for this device id,
    /// renumbering anything recorded here before the first sync.
    fn restore_if_pending(&mut self) -> Result<(), SyncError> {
        if !self.replica.restore_pending()? {
            return Ok(());
        }
        let device = self.replica.device_id().to_string();
        let retry = self.retry.clone();
        let deadline = self.deadline;
        let published = retry.run_until(deadline, "fetch own segment", || self.remote.fetch_segment(&device))?;

        // Seqs may move under the cache, so hold it and rebuild before
        // clearing the flag.
        let log = self.replica.log();
        let store = self.replica.open_store()?;
        let restored = log.restore_own(&published)?;
        ReplayEngine::new(log, &store).rebuild()?;
        drop(store);
        self.replica.finish_restore()?;

        if restored.changed() {
            info!(device = %device, adopted = restored.adopted, rebased = restored.rebased, "took over published events");
        }
        Ok(())
    }

    /// Per-device seq to fetch after: what the registry says was pulled,
    /// never beyond what the local log actually holds.
    fn fetch_frontier(&self) -> Result<BTreeMap<DeviceId, u64>, SyncError> {
        let held = self.replica.log().frontier()?;
        let synced = match self.replica.open_store() {
            Ok(store) => DeviceRegistry::new(&store, self.replica.device_id()).synced_frontier()?,
            Err(DevsyncError::DbBusy(_)) => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(held
            .into_iter()
            .map(|(device, seq)| {
                let floor = synced.get(&device).copied().map_or(seq, |s| s.min(seq));
                (device, floor)
            })
            .collect())
    }

    fn record(&self, f: impl FnOnce(&DeviceRegistry) -> Result<(), DevsyncError>) {
        let outcome = self
            .replica
            .open_store()
            .and_then(|store| f(&DeviceRegistry::new(&store, self.replica.device_id())));
        if let Err(e) = outcome {
            warn!(error = %e, "could not update device registry");
        }
    }
}

/// First published seq whose event is missing from, or different in, the
/// local segment
fn first_divergence(local: &[Event], published: &[Event]) -> Option<u64> {
    published
        .iter()
        .find(|remote| match local.binary_search_by_key(&remote.seq, |e| e.seq) {
            Ok(index) => local[index] != **remote,
            Err(_) => true,
        })
        .map(|remote| remote.seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use libdevsync_core::EventKind;

    fn event(seq: u64, value: &str) -> Event {
        Event::new(
            "laptop".to_string(),
            seq,
            Utc.timestamp_opt(1_700_000_000 + seq as i64, 0).unwrap(),
            EventKind::SetConfig {
                key: "editor".to_string(),
                value: value.to_string(),
            },
        )
    }

    #[test]
    fn test_first_divergence() {
        let local = vec![event(1, "vim"), event(2, "hx")];
        assert_eq!(first_divergence(&local, &[]), None);
        assert_eq!(first_divergence(&local, &local[..1]), None);
        assert_eq!(first_divergence(&local, &[event(1, "vim"), event(2, "nano")]), Some(2));
        assert_eq!(first_divergence(&local[..1], &local), Some(2));
        assert_eq!(first_divergence(&[], &[event(1, "vim")]), Some(1));
    }
}
