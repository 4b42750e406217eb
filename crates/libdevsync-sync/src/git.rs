//! Remote backed by a git repository
//!
//! Segments live on one branch as `events/<device_id>.log`. Every push is a
//! commit on top of the freshly fetched branch head that rewrites exactly one
//! device's segment blob, so a rejected push only ever means another device
//! got there first.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

use git2::{
    Commit, Cred, CredentialType, ErrorCode, FetchOptions, Oid, PushOptions, RemoteCallbacks,
    Repository, Signature, Tree,
};
use libdevsync_core::log::scan_segment;
use libdevsync_core::types::ids::DeviceId;
use libdevsync_core::Event;
use tracing::{debug, info};

use crate::error::SyncError;
use crate::remote::{encode_lines, segment_device, Remote, RemoteSegment};

/// Directory inside the branch holding segments
pub const EVENTS_DIR: &str = "events";

const REMOTE_NAME: &str = "origin";
const MAX_AUTH_ATTEMPTS: u32 = 3;

static NETWORK_TIMEOUTS: Once = Once::new();

/// A commit prepared for push
struct Staged {
    /// Remote head once the commit lands
    remote_head: u64,
    commit: Option<Oid>,
    count: usize,
}

pub struct GitRemote {
    repo: Repository,
    url: String,
    branch: String,
    timeout: Duration,
}

impl GitRemote {
    /// Open (creating if needed) the bare cache repository at `cache_dir`.
    ///
    /// The first call in a process also bounds libgit2's connect and socket
    /// timeouts by `timeout`.
    pub fn open(cache_dir: &Path, url: &str, branch: &str, timeout: Duration) -> Result<Self, SyncError> {
        set_network_timeouts(timeout)?;

        let repo = if cache_dir.join("HEAD").exists() {
            Repository::open_bare(cache_dir)?
        } else {
            std::fs::create_dir_all(cache_dir)?;
            Repository::init_bare(cache_dir)?
        };

        match repo.find_remote(REMOTE_NAME) {
            Ok(existing) if existing.url() == Some(url) => {}
            Ok(_) => repo.remote_set_url(REMOTE_NAME, url)?,
            Err(_) => {
                repo.remote(REMOTE_NAME, url)?;
            }
        }

        Ok(Self {
            repo,
            url: url.to_string(),
            branch: branch.to_string(),
            timeout,
        })
    }

    fn tracking_ref(&self) -> String {
        format!("refs/remotes/{}/{}", REMOTE_NAME, self.branch)
    }

    fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    /// Fetch the branch and return its head, `None` for an empty remote
    fn fetch(&self) -> Result<Option<Oid>, SyncError> {
        let refspec = format!("+{}:{}", self.branch_ref(), self.tracking_ref());
        let mut remote = self.repo.find_remote(REMOTE_NAME)?;

        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(callbacks(Instant::now() + self.timeout));

        remote
            .fetch(&[refspec.as_str()], Some(&mut fetch_options), None)
            .map_err(|e| network_error(&self.url, e))?;

        self.head()
    }

    fn head(&self) -> Result<Option<Oid>, SyncError> {
        match self.repo.find_reference(&self.tracking_ref()) {
            Ok(reference) => Ok(reference.target()),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn head_commit(&self, head: Option<Oid>) -> Result<Option<Commit<'_>>, SyncError> {
        Ok(head.map(|oid| self.repo.find_commit(oid)).transpose()?)
    }

    /// Raw bytes of a device's segment in `tree`
    fn segment_bytes(&self, tree: &Tree, device: &str) -> Result<Vec<u8>, SyncError> {
        let path = format!("{}/{}.log", EVENTS_DIR, device);
        match tree.get_path(Path::new(&path)) {
            Ok(entry) => Ok(self.repo.find_blob(entry.id())?.content().to_vec()),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Build a tree equal to `base` with one segment blob replaced
    fn write_segment_tree(&self, base: Option<&Tree>, device: &str, blob: Oid) -> Result<Oid, SyncError> {
        let mut root = self.repo.treebuilder(base)?;

        let existing = match base.and_then(|t| t.get_name(EVENTS_DIR)) {
            Some(entry) => Some(self.repo.find_tree(entry.id())?),
            None => None,
        };
        let mut events = self.repo.treebuilder(existing.as_ref())?;
        events.insert(format!("{}.log", device), blob, 0o100644)?;
        let events_oid = events.write()?;

        root.insert(EVENTS_DIR, events_oid, 0o040000)?;
        Ok(root.write()?)
    }

    /// Commit `events` onto `device`'s segment on top of `head` and point
    /// the local branch at the result. Nothing is committed when the remote
    /// already has every event.
    fn stage_segment(&self, head: Option<Oid>, device: &str, events: &[Event]) -> Result<Staged, SyncError> {
        let parent = self.head_commit(head)?;
        let base_tree = parent.as_ref().map(|c| c.tree()).transpose()?;

        let existing = match &base_tree {
            Some(tree) => self.segment_bytes(tree, device)?,
            None => Vec::new(),
        };
        let scan = scan_segment(&existing, device);
        if let Some(corruption) = scan.corruption {
            return Err(SyncError::CorruptSegment {
                device: device.to_string(),
                reason: corruption.reason,
            });
        }

        let remote_head = scan.last_seq();
        let fresh: Vec<Event> = events.iter().filter(|e| e.seq > remote_head).cloned().collect();
        let (Some(first), Some(last)) = (fresh.first(), fresh.last()) else {
            return Ok(Staged {
                remote_head,
                commit: None,
                count: 0,
            });
        };

        let mut content = existing[..scan.complete_len].to_vec();
        content.extend_from_slice(&encode_lines(&fresh)?);
        let blob = self.repo.blob(&content)?;
        let tree_oid = self.write_segment_tree(base_tree.as_ref(), device, blob)?;
        let tree = self.repo.find_tree(tree_oid)?;

        let sig = Signature::now("devsync", "devsync@local")?;
        let message = format!("{}: events {}..={}", device, first.seq, last.seq);
        let parents: Vec<&Commit> = parent.iter().collect();
        let commit = self.repo.commit(None, &sig, &sig, &message, &tree, &parents)?;
        self.repo.reference(&self.branch_ref(), commit, true, "devsync stage")?;

        Ok(Staged {
            remote_head: last.seq,
            commit: Some(commit),
            count: fresh.len(),
        })
    }

    /// Push the local branch ref. A non-fast-forward rejection is a conflict.
    fn push(&self) -> Result<(), SyncError> {
        let refspec = format!("{}:{}", self.branch_ref(), self.branch_ref());
        let mut remote = self.repo.find_remote(REMOTE_NAME)?;

        let rejection: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
        let rejection_clone = Rc::clone(&rejection);

        let mut cbs = callbacks(Instant::now() + self.timeout);
        cbs.push_update_reference(move |refname, status| {
            if let Some(msg) = status {
                *rejection_clone.borrow_mut() = Some(format!("{}: {}", refname, msg));
            }
            Ok(())
        });

        let mut push_options = PushOptions::new();
        push_options.remote_callbacks(cbs);

        remote
            .push(&[refspec.as_str()], Some(&mut push_options))
            .map_err(|e| network_error(&self.url, e))?;

        let rejected = rejection.borrow().clone();
        match rejected {
            Some(msg) => Err(SyncError::Conflict(msg)),
            None => Ok(()),
        }
    }
}

impl Remote for GitRemote {
    fn describe(&self) -> String {
        format!("git:{}#{}", self.url, self.branch)
    }

    fn fetch_segment(&mut self, device: &str) -> Result<Vec<Event>, SyncError> {
        let head = self.fetch()?;
        let Some(commit) = self.head_commit(head)? else {
            return Ok(Vec::new());
        };
        let scan = scan_segment(&self.segment_bytes(&commit.tree()?, device)?, device);
        if let Some(corruption) = scan.corruption {
            return Err(SyncError::CorruptSegment {
                device: device.to_string(),
                reason: corruption.reason,
            });
        }
        Ok(scan.events)
    }

    fn append_segment(&mut self, device: &str, events: &[Event]) -> Result<u64, SyncError> {
        let head = self.fetch()?;
        let staged = self.stage_segment(head, device, events)?;
        let Some(commit) = staged.commit else {
            return Ok(staged.remote_head);
        };

        self.push()?;

        self.repo
            .reference(&self.tracking_ref(), commit, true, "devsync push")?;
        info!(device = %device, count = staged.count, head = staged.remote_head, "pushed to git remote");
        Ok(staged.remote_head)
    }

    fn fetch_segments(&mut self, since: &BTreeMap<DeviceId, u64>) -> Result<Vec<RemoteSegment>, SyncError> {
        let head = self.fetch()?;
        let Some(commit) = self.head_commit(head)? else {
            debug!(url = %self.url, "remote branch is empty");
            return Ok(Vec::new());
        };
        let tree = commit.tree()?;
        let Some(events_entry) = tree.get_name(EVENTS_DIR) else {
            return Ok(Vec::new());
        };
        let events_tree = self.repo.find_tree(events_entry.id())?;

        let mut segments = Vec::new();
        for entry in events_tree.iter() {
            let Some(device) = entry.name().and_then(segment_device) else {
                continue;
            };
            let bytes = self.repo.find_blob(entry.id())?.content().to_vec();
            let floor = since.get(device).copied().unwrap_or(0);
            segments.push(RemoteSegment::parse(device, bytes, floor));
        }
        Ok(segments)
    }
}

/// Bound connect, handshake and every socket read or write. The progress
/// callbacks below only fire once data is moving.
fn set_network_timeouts(timeout: Duration) -> Result<(), SyncError> {
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    let mut result = Ok(());
    NETWORK_TIMEOUTS.call_once(|| {
        // SAFETY: these are plain libgit2 globals. `Once` makes this the only
        // write, and it happens before this process opens a transport
        // through a GitRemote.
        result = unsafe {
            git2::opts::set_server_connect_timeout_in_milliseconds(millis)
                .and_then(|()| git2::opts::set_server_timeout_in_milliseconds(millis))
        };
        debug!(millis, "git network timeouts set");
    });
    Ok(result?)
}

/// Callbacks shared by fetch and push: ssh-agent credentials and a deadline
/// enforced through the progress callbacks.
fn callbacks<'a>(deadline: Instant) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();

    let mut auth_attempts = 0;
    callbacks.credentials(move |_url, username, allowed| {
        auth_attempts += 1;
        if auth_attempts > MAX_AUTH_ATTEMPTS {
            return Err(git2::Error::from_str("authentication failed"));
        }
        if allowed.contains(CredentialType::SSH_KEY) {
            Cred::ssh_key_from_agent(username.unwrap_or("git"))
        } else if allowed.contains(CredentialType::DEFAULT) {
            Cred::default()
        } else {
            Err(git2::Error::from_str("no supported credential type"))
        }
    });
    callbacks.transfer_progress(move |_stats| Instant::now() < deadline);
    callbacks.sideband_progress(move |_data| Instant::now() < deadline);
    callbacks
}

/// Classify a failure of a fetch or push
fn network_error(url: &str, err: git2::Error) -> SyncError {
    match err.code() {
        ErrorCode::NotFastForward => SyncError::Conflict(err.message().to_string()),
        ErrorCode::User => SyncError::Unreachable(format!("{}: operation timed out", url)),
        _ => SyncError::Unreachable(format!("{}: {}", url, err.message())),
    }
}
