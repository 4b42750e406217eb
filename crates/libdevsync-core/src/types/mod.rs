pub mod ids;
pub mod event;
pub mod state;
pub mod device;

pub use ids::{generate_device_id, validate_device_id, DeviceId, WILDCARD_DEVICE};
pub use event::{CanonicalKey, Event, EventKind, OrderTarget};
pub use state::{CommandEntry, MaterializedState, ProjectEntry};
pub use device::{DeviceConfig, DeviceRecord};
