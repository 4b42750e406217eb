//! Replicas syncing through a bare git repository

use std::path::Path;

use libdevsync_core::{DevsyncConfig, EventKind, RemoteConfig, Replica};
use libdevsync_sync::{connect, RetryPolicy, SyncTransport};
use tempfile::tempdir;

fn replica(dir: &Path, id: &str, origin: &Path) -> Replica {
    let mut replica = Replica::init(dir, Some(id.to_string()), None).unwrap();
    replica
        .save_config(DevsyncConfig {
            remote: Some(RemoteConfig::Git {
                url: origin.to_string_lossy().into_owned(),
                branch: "main".to_string(),
            }),
            ..Default::default()
        })
        .unwrap();
    replica
}

fn sync(replica: &Replica) -> libdevsync_sync::SyncReport {
    let remote = connect(replica).unwrap();
    SyncTransport::new(replica, remote)
        .with_retry(RetryPolicy::none())
        .sync()
        .unwrap()
}

#[test]
fn test_two_devices_converge_over_git() {
    let root = tempdir().unwrap();
    let origin = root.path().join("origin.git");
    git2::Repository::init_bare(&origin).unwrap();

    let laptop = replica(&root.path().join("laptop"), "laptop", &origin);
    let desktop = replica(&root.path().join("desktop"), "desktop", &origin);

    laptop
        .record(EventKind::AddProject {
            path: "/src/api".to_string(),
            repo_url: Some("git@example.com:api.git".to_string()),
            device: None,
        })
        .unwrap();
    desktop
        .record(EventKind::AddCommand {
            name: "test".to_string(),
            command: "cargo test".to_string(),
            device: None,
        })
        .unwrap();

    let first = sync(&laptop);
    assert_eq!(first.push.pushed, 1);

    let second = sync(&desktop);
    assert_eq!(second.pull.applied, 1);
    assert_eq!(second.push.pushed, 1);

    let third = sync(&laptop);
    assert_eq!(third.pull.applied, 1);
    assert_eq!(third.push.pushed, 0);

    let a = laptop.state().unwrap();
    let b = desktop.state().unwrap();
    assert_eq!(a, b);
    assert_eq!(a.live_project_count(), 1);
    assert_eq!(a.ordered_commands().len(), 1);
}

#[test]
fn test_sync_after_sync_is_noop() {
    let root = tempdir().unwrap();
    let origin = root.path().join("origin.git");
    git2::Repository::init_bare(&origin).unwrap();

    let laptop = replica(&root.path().join("laptop"), "laptop", &origin);
    laptop
        .record(EventKind::SetConfig {
            key: "editor".to_string(),
            value: "vim".to_string(),
        })
        .unwrap();

    sync(&laptop);
    let again = sync(&laptop);
    assert_eq!(again.pull.applied, 0);
    assert_eq!(again.push.pushed, 0);
}
