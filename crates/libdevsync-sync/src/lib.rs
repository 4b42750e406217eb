//! Sync transports for devsync
//!
//! This crate moves event log segments between devices:
//! - a shared-directory remote (`<root>/events/<device>.log`)
//! - a git remote holding the same layout on one branch
//! - retry with exponential backoff for transient failures
//! - the push/pull state machine with pull-and-retry on push conflicts

mod error;
mod remote;
mod dir;
mod git;
mod retry;
mod transport;

pub use error::SyncError;
pub use remote::{Remote, RemoteSegment};
pub use dir::DirRemote;
pub use git::{GitRemote, EVENTS_DIR};
pub use retry::RetryPolicy;
pub use transport::{connect, PullReport, PushReport, SyncPhase, SyncReport, SyncTransport};
