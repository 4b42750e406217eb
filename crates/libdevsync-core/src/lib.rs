pub mod types;
pub mod error;
pub mod config;
pub mod hash;
pub mod log;
pub mod materialize;
pub mod store;
pub mod registry;
pub mod replay;
pub mod integrity;
pub mod replica;

pub use error::DevsyncError;
pub use types::{
    CanonicalKey, CommandEntry, DeviceConfig, DeviceId, DeviceRecord, Event, EventKind,
    MaterializedState, OrderTarget, ProjectEntry, WILDCARD_DEVICE,
};
pub use config::{load_config, save_config, DevsyncConfig, RebuildPolicy, RemoteConfig, SyncSettings};
pub use log::{EventLog, LogRead, MergeReport, RestoreReport};
pub use materialize::{ApplyOutcome, Materializer};
pub use store::{DbStats, LockedStore, StateStore};
pub use registry::DeviceRegistry;
pub use replay::{CatchUpReport, RebuildReport, ReplayEngine, VerifyReport};
pub use integrity::{check_log, IntegrityReport};
pub use replica::Replica;
