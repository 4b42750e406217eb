//! Rebuild and incremental maintenance of the cached state
//!
//! The cache is disposable: whatever it holds, `rebuild` reproduces the state
//! from the event log alone. The incremental paths (`catch_up`, `apply_new`)
//! must always land on the same state a rebuild would, so they fall back to a
//! full replay whenever an event sorts before the cache's watermark.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::DevsyncError;
use crate::hash::{fingerprint_hex, state_fingerprint};
use crate::log::EventLog;
use crate::materialize::{ApplyOutcome, Materializer};
use crate::store::StateStore;
use crate::types::event::{sort_canonical, Event};
use crate::types::ids::DeviceId;
use crate::types::state::MaterializedState;

/// Statistics from a rebuild operation
#[derive(Debug, Serialize)]
pub struct RebuildReport {
    pub event_count: usize,
    pub skipped: u64,
    pub live_projects: usize,
    /// Segments left out because they are corrupt
    pub corrupt_segments: Vec<DeviceId>,
    pub fingerprint: String,
}

/// Outcome of bringing the cache up to date
#[derive(Debug, Default, Serialize)]
pub struct CatchUpReport {
    /// Events folded incrementally
    pub applied: usize,
    /// True when the cache was recomputed from the whole log
    pub replayed: bool,
}

/// Comparison of the cache against a fresh replay
#[derive(Debug, Serialize)]
pub struct VerifyReport {
    pub cached: Option<String>,
    pub replayed: String,
    /// Cache has not yet seen every event in the log
    pub cache_behind: bool,
    pub matches: bool,
}

/// Drives the materializer over the event log and keeps the cache current
pub struct ReplayEngine<'a> {
    log: &'a EventLog,
    store: &'a StateStore,
}

impl<'a> ReplayEngine<'a> {
    pub fn new(log: &'a EventLog, store: &'a StateStore) -> Self {
        Self { log, store }
    }

    /// Fold events from empty state in canonical order
    pub fn replay(events: &[Event]) -> MaterializedState {
        let mut ordered = events.to_vec();
        sort_canonical(&mut ordered);

        let mut materializer = Materializer::new();
        for event in &ordered {
            materializer.apply(event);
        }
        materializer.into_state()
    }

    /// Discard the cache and recompute it from the log
    pub fn rebuild(&self) -> Result<(RebuildReport, MaterializedState), DevsyncError> {
        self.store.clear_state()?;

        let read = self.log.read_all()?;
        for corrupt in &read.corrupt {
            warn!(device = %corrupt.device_id, "rebuild excludes corrupt segment");
        }

        let state = Self::replay(&read.events);
        self.store.save_state(&state, 0)?;
        self.store.mark_rebuilt()?;

        let report = RebuildReport {
            event_count: read.events.len(),
            skipped: state.skipped,
            live_projects: state.live_project_count(),
            corrupt_segments: read.corrupt.into_iter().map(|c| c.device_id).collect(),
            fingerprint: fingerprint_hex(&state_fingerprint(&state)?),
        };
        info!(events = report.event_count, skipped = report.skipped, "rebuilt state cache");
        Ok((report, state))
    }

    /// Fold every log event the cache has not seen yet
    pub fn catch_up(&self) -> Result<(CatchUpReport, MaterializedState), DevsyncError> {
        let Some(cached) = self.store.load_state()? else {
            return self.replay_all();
        };

        let read = self.log.read_since(&cached.frontier)?;
        if read.events.is_empty() {
            return Ok((CatchUpReport::default(), cached));
        }
        self.fold_onto(cached, &read.events)
    }

    /// Fold events that were just appended or merged.
    ///
    /// Anything that does not continue the cache's per-device frontier means
    /// the cache missed events (a deferred apply, a gap), so the log is
    /// consulted instead.
    pub fn apply_new(&self, events: &[Event]) -> Result<(CatchUpReport, MaterializedState), DevsyncError> {
        let Some(cached) = self.store.load_state()? else {
            return self.replay_all();
        };

        let mut ordered = events.to_vec();
        sort_canonical(&mut ordered);

        let mut expected = cached.frontier.clone();
        for event in &ordered {
            let next = expected.entry(event.device_id.clone()).or_insert(0);
            if event.seq != *next + 1 {
                debug!(device = %event.device_id, seq = event.seq, "cache not contiguous, catching up from log");
                return self.catch_up();
            }
            *next = event.seq;
        }

        self.fold_onto(cached, &ordered)
    }

    /// Compare the cached state with a fresh replay without writing anything
    pub fn verify(&self) -> Result<VerifyReport, DevsyncError> {
        let read = self.log.read_all()?;
        let replayed = Self::replay(&read.events);
        let replayed_fp = fingerprint_hex(&state_fingerprint(&replayed)?);

        let cached = self.store.load_state()?;
        let cache_behind = cached
            .as_ref()
            .map(|c| c.frontier != replayed.frontier)
            .unwrap_or(true);
        let cached_fp = match &cached {
            Some(state) => Some(fingerprint_hex(&state_fingerprint(state)?)),
            None => None,
        };

        Ok(VerifyReport {
            matches: cached_fp.as_deref() == Some(replayed_fp.as_str()),
            cached: cached_fp,
            replayed: replayed_fp,
            cache_behind,
        })
    }

    fn fold_onto(
        &self,
        cached: MaterializedState,
        events: &[Event],
    ) -> Result<(CatchUpReport, MaterializedState), DevsyncError> {
        let mut materializer = Materializer::from_state(cached);
        let mut report = CatchUpReport::default();

        for event in events {
            match materializer.apply(event) {
                ApplyOutcome::OutOfOrder => {
                    debug!(device = %event.device_id, seq = event.seq, "event sorts before watermark, replaying");
                    return self.replay_all();
                }
                ApplyOutcome::Stale => {}
                ApplyOutcome::Applied | ApplyOutcome::Skipped => report.applied += 1,
            }
        }

        let state = materializer.into_state();
        self.store.save_state(&state, report.applied as u64)?;
        Ok((report, state))
    }

    fn replay_all(&self) -> Result<(CatchUpReport, MaterializedState), DevsyncError> {
        let previous = self.store.load_state()?.map(|s| s.applied_count()).unwrap_or(0);
        let read = self.log.read_all()?;
        let state = Self::replay(&read.events);
        let applied = state.applied_count().saturating_sub(previous);
        self.store.save_state(&state, applied)?;
        Ok((
            CatchUpReport {
                applied: applied as usize,
                replayed: true,
            },
            state,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::event::EventKind;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn set(key: &str, value: &str) -> EventKind {
        EventKind::SetConfig {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn foreign(device: &str, seq: u64, secs: i64, kind: EventKind) -> Event {
        Event::new(
            device.to_string(),
            seq,
            Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            kind,
        )
    }

    #[test]
    fn test_replay_is_idempotent() {
        let events = vec![
            foreign("a", 1, 1, set("x", "1")),
            foreign("b", 1, 2, set("x", "2")),
            foreign("a", 2, 3, set("y", "1")),
        ];
        let once = ReplayEngine::replay(&events);
        let doubled: Vec<Event> = events.iter().chain(events.iter()).cloned().collect();
        assert_eq!(ReplayEngine::replay(&doubled), once);
        assert_eq!(once.config.get("x").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_catch_up_matches_rebuild() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), "a").unwrap();
        let store = StateStore::open(&dir.path().join("state")).unwrap();
        let engine = ReplayEngine::new(&log, &store);

        log.append_at(set("x", "1"), Utc.timestamp_opt(1_700_000_010, 0).unwrap())
            .unwrap();
        engine.catch_up().unwrap();

        // arrives after the cache already moved past it
        log.merge_foreign(vec![foreign("b", 1, 5, set("x", "late"))]).unwrap();
        let (report, incremental) = engine.catch_up().unwrap();
        assert!(report.replayed);

        let (_, rebuilt) = engine.rebuild().unwrap();
        assert_eq!(incremental, rebuilt);
        assert_eq!(rebuilt.config.get("x").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_apply_new_falls_back_when_cache_missed_events() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), "a").unwrap();
        let store = StateStore::open(&dir.path().join("state")).unwrap();
        let engine = ReplayEngine::new(&log, &store);

        let first = log.append(set("x", "1")).unwrap();
        engine.apply_new(&[first]).unwrap();

        // appended while the cache was busy
        log.append(set("y", "1")).unwrap();
        let third = log.append(set("z", "1")).unwrap();

        let (_, state) = engine.apply_new(&[third]).unwrap();
        assert_eq!(state.config.len(), 3);
        assert_eq!(state.frontier.get("a"), Some(&3));
    }

    #[test]
    fn test_verify_detects_stale_cache() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), "a").unwrap();
        let store = StateStore::open(&dir.path().join("state")).unwrap();
        let engine = ReplayEngine::new(&log, &store);

        log.append(set("x", "1")).unwrap();
        engine.rebuild().unwrap();
        assert!(engine.verify().unwrap().matches);

        log.append(set("x", "2")).unwrap();
        let report = engine.verify().unwrap();
        assert!(!report.matches);
        assert!(report.cache_behind);
    }
}
