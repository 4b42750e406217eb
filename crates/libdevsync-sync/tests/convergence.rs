//! Multi-device convergence through a shared-directory remote

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use libdevsync_core::hash::{state_fingerprint, Fingerprint};
use libdevsync_core::{
    DevsyncConfig, DevsyncError, Event, EventKind, OrderTarget, RemoteConfig, Replica,
};
use libdevsync_sync::{
    connect, DirRemote, Remote, RemoteSegment, RetryPolicy, SyncError, SyncTransport,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::{tempdir, TempDir};

const DEVICES: [&str; 3] = ["dev-a", "dev-b", "dev-c"];

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

struct Fleet {
    _dirs: Vec<TempDir>,
    remote_root: TempDir,
    replicas: Vec<Replica>,
}

impl Fleet {
    fn new() -> Self {
        let remote_root = tempdir().unwrap();
        let mut dirs = Vec::new();
        let mut replicas = Vec::new();
        for id in DEVICES {
            let dir = tempdir().unwrap();
            let mut replica = Replica::init(dir.path(), Some(id.to_string()), None).unwrap();
            replica
                .save_config(DevsyncConfig {
                    remote: Some(RemoteConfig::Dir {
                        path: remote_root.path().to_path_buf(),
                    }),
                    ..Default::default()
                })
                .unwrap();
            dirs.push(dir);
            replicas.push(replica);
        }
        Self {
            _dirs: dirs,
            remote_root,
            replicas,
        }
    }

    fn transport(&self, device: usize) -> SyncTransport<'_, DirRemote> {
        SyncTransport::new(
            &self.replicas[device],
            DirRemote::new(self.remote_root.path(), Duration::from_secs(5)),
        )
        .with_retry(RetryPolicy::none())
    }

    fn sync_all(&self) {
        for round in 0..2 {
            for device in 0..self.replicas.len() {
                self.transport(device)
                    .sync()
                    .unwrap_or_else(|e| panic!("round {} device {}: {}", round, device, e));
            }
        }
    }

    fn fingerprints(&self) -> Vec<Fingerprint> {
        self.replicas
            .iter()
            .map(|r| {
                r.rebuild().unwrap();
                state_fingerprint(&r.state().unwrap()).unwrap()
            })
            .collect()
    }
}

/// A fixed workload: per device, the kinds it records and their clock readings
fn workload(seed: u64, total: usize) -> Vec<Vec<(DateTime<Utc>, EventKind)>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut per_device: Vec<Vec<(DateTime<Utc>, EventKind)>> = vec![Vec::new(); DEVICES.len()];
    let paths = ["/src/api", "/src/web", "/src/cli", "/src/docs", "/src/infra"];
    let names = ["build", "test", "lint", "deploy"];

    for i in 0..total {
        let device = rng.gen_range(0..DEVICES.len());
        let path = paths[rng.gen_range(0..paths.len())].to_string();
        let name = names[rng.gen_range(0..names.len())].to_string();
        let kind = match rng.gen_range(0..8) {
            0 | 1 => EventKind::AddProject {
                path,
                repo_url: None,
                device: if rng.gen_bool(0.2) {
                    Some(DEVICES[device].to_string())
                } else {
                    None
                },
            },
            2 => EventKind::RemoveProject { path, device: None },
            3 => EventKind::SetConfig {
                key: format!("key{}", rng.gen_range(0..4)),
                value: i.to_string(),
            },
            4 => EventKind::AddCommand {
                name,
                command: format!("make {}", i),
                device: if rng.gen_bool(0.2) {
                    Some(DEVICES[device].to_string())
                } else {
                    None
                },
            },
            5 => EventKind::RemoveCommand { name, device: None },
            6 => {
                let mut order: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
                order.rotate_left(rng.gen_range(0..paths.len()));
                order.truncate(rng.gen_range(1..=paths.len()));
                EventKind::Reorder {
                    target: OrderTarget::Projects,
                    order,
                }
            }
            _ => EventKind::Reorder {
                target: OrderTarget::Commands,
                order: vec![name],
            },
        };
        // clocks drift: each device may lag the others
        let skew = rng.gen_range(-30..30);
        per_device[device].push((ts(i as i64 + skew), kind));
    }
    per_device
}

/// Record the workload on a fresh fleet with randomly interleaved syncs
fn run(workload: &[Vec<(DateTime<Utc>, EventKind)>], interleave_seed: u64) -> Vec<Fingerprint> {
    let fleet = Fleet::new();
    let mut rng = StdRng::seed_from_u64(interleave_seed);
    let mut cursors = vec![0usize; workload.len()];

    loop {
        let open: Vec<usize> = (0..workload.len())
            .filter(|d| cursors[*d] < workload[*d].len())
            .collect();
        if open.is_empty() {
            break;
        }
        let device = open[rng.gen_range(0..open.len())];
        let (wall_time, kind) = workload[device][cursors[device]].clone();
        cursors[device] += 1;
        fleet.replicas[device].log().append_at(kind, wall_time).unwrap();

        if rng.gen_bool(0.03) {
            let who = rng.gen_range(0..DEVICES.len());
            let mut transport = fleet.transport(who);
            match rng.gen_range(0..3) {
                0 => {
                    transport.push().unwrap();
                }
                1 => {
                    transport.pull().unwrap();
                }
                _ => {
                    transport.sync().unwrap();
                }
            }
        }
    }

    fleet.sync_all();
    fleet.fingerprints()
}

#[test]
fn test_rebuild_identical_across_interleavings() {
    let workload = workload(7, 1000);

    let first = run(&workload, 1);
    assert!(first.windows(2).all(|w| w[0] == w[1]), "devices diverged within a run");

    let second = run(&workload, 99);
    assert!(second.windows(2).all(|w| w[0] == w[1]), "devices diverged within a run");

    assert_eq!(first[0], second[0]);
}

#[test]
fn test_same_project_on_two_devices_after_sync() {
    let fleet = Fleet::new();
    let add = || EventKind::AddProject {
        path: "/p1".to_string(),
        repo_url: None,
        device: None,
    };
    fleet.replicas[0].record(add()).unwrap();
    fleet.replicas[1].record(add()).unwrap();

    fleet.sync_all();
    for replica in &fleet.replicas[..2] {
        let state = replica.state().unwrap();
        let paths: Vec<&str> = state.live_projects().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["/p1"]);
    }
}

#[test]
fn test_offline_readd_survives_sync() {
    let fleet = Fleet::new();
    let log_a = fleet.replicas[0].log();
    let log_b = fleet.replicas[1].log();
    let p2 = || "/p2".to_string();

    log_a
        .append_at(EventKind::AddProject { path: p2(), repo_url: None, device: None }, ts(0))
        .unwrap();
    fleet.sync_all();

    log_a
        .append_at(EventKind::RemoveProject { path: p2(), device: None }, ts(100))
        .unwrap();
    log_b
        .append_at(EventKind::RemoveProject { path: p2(), device: None }, ts(100))
        .unwrap();
    log_b
        .append_at(EventKind::AddProject { path: p2(), repo_url: None, device: None }, ts(101))
        .unwrap();
    fleet.sync_all();

    for replica in &fleet.replicas {
        let state = replica.state().unwrap();
        assert_eq!(state.live_project_count(), 1, "device {}", replica.device_id());
    }
}

#[test]
fn test_registry_tracks_pull_and_push() {
    let fleet = Fleet::new();
    fleet.replicas[1]
        .record(EventKind::SetConfig { key: "k".to_string(), value: "v".to_string() })
        .unwrap();
    fleet.replicas[0]
        .record(EventKind::SetConfig { key: "k".to_string(), value: "w".to_string() })
        .unwrap();

    fleet.transport(1).push().unwrap();
    let report = fleet.transport(0).sync().unwrap();
    assert_eq!(report.pull.applied, 1);
    assert_eq!(report.push.pushed, 1);

    let store = fleet.replicas[0].open_store().unwrap();
    let registry = libdevsync_core::DeviceRegistry::new(&store, "dev-a");
    assert_eq!(registry.last_synced("dev-b").unwrap(), 1);
    assert_eq!(registry.last_pushed().unwrap(), 1);
}

#[test]
fn test_unreachable_remote_keeps_local_writes() {
    let dir = tempdir().unwrap();
    let replica = Replica::init(dir.path(), Some("dev-a".to_string()), None).unwrap();
    let event = replica
        .record(EventKind::SetConfig { key: "k".to_string(), value: "v".to_string() })
        .unwrap();

    let mut transport = SyncTransport::new(
        &replica,
        DirRemote::new(dir.path().join("unmounted"), Duration::from_secs(1)),
    )
    .with_retry(RetryPolicy {
        max_retries: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        timeout: None,
    });

    let err = transport.push().unwrap_err();
    assert!(matches!(err, SyncError::RetriesExhausted { attempts: 3, .. }));
    let core: DevsyncError = err.into();
    assert_eq!(core.exit_code(), 6);

    assert_eq!(replica.log().read_all().unwrap().events, vec![event]);
}

#[test]
fn test_connect_requires_configured_remote() {
    let dir = tempdir().unwrap();
    let replica = Replica::init(dir.path(), Some("dev-a".to_string()), None).unwrap();
    assert!(matches!(connect(&replica), Err(DevsyncError::NotFound(_))));
}

#[test]
fn test_corrupt_remote_segment_is_quarantined() {
    let fleet = Fleet::new();
    fleet.replicas[1]
        .record(EventKind::SetConfig { key: "k".to_string(), value: "v".to_string() })
        .unwrap();
    fleet.transport(1).push().unwrap();

    let events_dir = fleet.remote_root.path().join("events");
    std::fs::write(events_dir.join("rogue.log"), b"not an event\n").unwrap();

    let report = fleet.transport(0).pull().unwrap();
    assert_eq!(report.quarantined, vec!["rogue".to_string()]);
    assert_eq!(report.applied, 1);

    let quarantine = fleet.replicas[0].data_dir().join("quarantine");
    assert_eq!(std::fs::read_dir(&quarantine).unwrap().count(), 1);

    for _ in 0..3 {
        let again = fleet.transport(0).pull().unwrap();
        assert_eq!(again.quarantined, vec!["rogue".to_string()]);
    }
    assert_eq!(std::fs::read_dir(&quarantine).unwrap().count(), 1);
}

fn config_value(replica: &Replica, key: &str) -> Option<String> {
    replica.state().unwrap().config.get(key).cloned()
}

#[test]
fn test_reused_device_id_takes_over_published_events() {
    let fleet = Fleet::new();
    fleet.replicas[0]
        .record(EventKind::SetConfig { key: "editor".to_string(), value: "vim".to_string() })
        .unwrap();
    fleet.transport(0).sync().unwrap();

    // Same device id, fresh data directory, a change made before any sync
    let dir = tempdir().unwrap();
    let mut reborn = Replica::init(dir.path(), Some(DEVICES[0].to_string()), None).unwrap();
    reborn
        .save_config(DevsyncConfig {
            remote: Some(RemoteConfig::Dir {
                path: fleet.remote_root.path().to_path_buf(),
            }),
            ..Default::default()
        })
        .unwrap();
    let early = reborn
        .record(EventKind::SetConfig { key: "theme".to_string(), value: "dark".to_string() })
        .unwrap();
    assert_eq!(early.seq, 1);

    let report = SyncTransport::new(&reborn, DirRemote::new(fleet.remote_root.path(), Duration::from_secs(5)))
        .with_retry(RetryPolicy::none())
        .sync()
        .unwrap();
    assert_eq!(report.push.pushed, 1);
    assert_eq!(report.push.remote_head, 2);
    assert!(!reborn.restore_pending().unwrap());

    let own: Vec<u64> = reborn.log().read_segment(DEVICES[0]).unwrap().events.iter().map(|e| e.seq).collect();
    assert_eq!(own, vec![1, 2]);
    assert_eq!(config_value(&reborn, "editor").as_deref(), Some("vim"));
    assert_eq!(config_value(&reborn, "theme").as_deref(), Some("dark"));

    fleet.transport(1).sync().unwrap();
    assert_eq!(config_value(&fleet.replicas[1], "editor").as_deref(), Some("vim"));
    assert_eq!(config_value(&fleet.replicas[1], "theme").as_deref(), Some("dark"));
}

#[test]
fn test_push_refuses_diverged_own_segment() {
    let fleet = Fleet::new();
    fleet.replicas[0]
        .record(EventKind::SetConfig { key: "editor".to_string(), value: "vim".to_string() })
        .unwrap();
    fleet.transport(0).push().unwrap();

    // A copy that skipped the takeover, e.g. a restored backup of device.toml
    let dir = tempdir().unwrap();
    let twin = Replica::init(dir.path(), Some(DEVICES[0].to_string()), None).unwrap();
    twin.finish_restore().unwrap();
    twin.record(EventKind::SetConfig { key: "theme".to_string(), value: "dark".to_string() })
        .unwrap();

    let mut transport = SyncTransport::new(&twin, DirRemote::new(fleet.remote_root.path(), Duration::from_secs(5)))
        .with_retry(RetryPolicy::none());
    let err = transport.push().unwrap_err();
    assert!(matches!(err, SyncError::Diverged { seq: 1, .. }), "got {:?}", err);
    let core: DevsyncError = err.into();
    assert_eq!(core.exit_code(), 7);

    let remote = fleet.remote_root.path().join("events").join("dev-a.log");
    let published = std::fs::read_to_string(remote).unwrap();
    assert!(published.contains("vim"));
    assert!(!published.contains("dark"));
}

/// Rejects the first `conflicts` appends the way a racing device would
struct Contended {
    inner: DirRemote,
    conflicts: u32,
}

impl Remote for Contended {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn fetch_segment(&mut self, device: &str) -> Result<Vec<Event>, SyncError> {
        self.inner.fetch_segment(device)
    }

    fn append_segment(&mut self, device: &str, events: &[Event]) -> Result<u64, SyncError> {
        if self.conflicts > 0 {
            self.conflicts -= 1;
            return Err(SyncError::Conflict("refs/heads/main: fetch first".to_string()));
        }
        self.inner.append_segment(device, events)
    }

    fn fetch_segments(&mut self, since: &BTreeMap<String, u64>) -> Result<Vec<RemoteSegment>, SyncError> {
        self.inner.fetch_segments(since)
    }
}

fn contended_push(root: &Path, replica: &Replica, conflicts: u32) -> Result<u32, SyncError> {
    let remote = Contended {
        inner: DirRemote::new(root, Duration::from_secs(5)),
        conflicts,
    };
    let mut transport = SyncTransport::new(replica, remote).with_retry(RetryPolicy {
        max_retries: 2,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        timeout: None,
    });
    transport.push().map(|r| r.conflicts)
}

#[test]
fn test_push_conflict_pulls_and_retries() {
    let fleet = Fleet::new();
    fleet.replicas[0]
        .record(EventKind::SetConfig { key: "k".to_string(), value: "v".to_string() })
        .unwrap();

    assert_eq!(contended_push(fleet.remote_root.path(), &fleet.replicas[0], 2).unwrap(), 2);

    fleet.replicas[0]
        .record(EventKind::SetConfig { key: "k".to_string(), value: "w".to_string() })
        .unwrap();
    let err = contended_push(fleet.remote_root.path(), &fleet.replicas[0], 3).unwrap_err();
    let core: DevsyncError = err.into();
    assert!(matches!(core, DevsyncError::ConflictOnPush(_)));
}
