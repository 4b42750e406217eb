use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::DeviceId;

/// Which ordered collection a `Reorder` event targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderTarget {
    Projects,
    Commands,
}

impl OrderTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderTarget::Projects => "projects",
            OrderTarget::Commands => "commands",
        }
    }
}

/// Event kind enum representing every recorded mutation.
///
/// On disk the variant name is the `kind` field and the variant body is the
/// `payload` field. Records this build cannot decode land in `Unknown` and are
/// kept verbatim so they re-serialize unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    AddProject {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo_url: Option<String>,
        /// Owning device; `None` means every device
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<DeviceId>,
    },
    RemoveProject {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<DeviceId>,
    },
    SetConfig {
        key: String,
        value: String,
    },
    AddCommand {
        name: String,
        command: String,
        /// Owning device; `None` means every device
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<DeviceId>,
    },
    RemoveCommand {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<DeviceId>,
    },
    Reorder {
        target: OrderTarget,
        order: Vec<String>,
    },
    #[serde(skip)]
    Unknown { kind: String, payload: Value },
}

impl EventKind {
    /// The snake_case kind name written to the `kind` field
    pub fn name(&self) -> &str {
        match self {
            EventKind::AddProject { .. } => "add_project",
            EventKind::RemoveProject { .. } => "remove_project",
            EventKind::SetConfig { .. } => "set_config",
            EventKind::AddCommand { .. } => "add_command",
            EventKind::RemoveCommand { .. } => "remove_command",
            EventKind::Reorder { .. } => "reorder",
            EventKind::Unknown { kind, .. } => kind,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, EventKind::Unknown { .. })
    }

    /// Decode a kind/payload pair, falling back to `Unknown` for records
    /// written by a newer or older build.
    pub fn decode(kind: String, payload: Value) -> Self {
        let tagged = serde_json::json!({ "kind": kind, "payload": payload });
        match serde_json::from_value::<EventKind>(tagged) {
            Ok(decoded) => decoded,
            Err(_) => EventKind::Unknown { kind, payload },
        }
    }

    /// Split into the on-disk kind/payload pair
    pub fn encode(&self) -> (String, Value) {
        if let EventKind::Unknown { kind, payload } = self {
            return (kind.clone(), payload.clone());
        }
        let payload = match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        (self.name().to_string(), payload)
    }
}

/// Position of an event in canonical order: `(wall_time, device_id, seq)`.
///
/// Field order matters, the derived `Ord` compares them left to right.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalKey {
    pub wall_time: DateTime<Utc>,
    pub device_id: DeviceId,
    pub seq: u64,
}

/// Raw line format of a segment file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub device_id: DeviceId,
    pub seq: u64,
    pub wall_time: DateTime<Utc>,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// One immutable, device-attributed record of a state mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EventRecord", into = "EventRecord")]
pub struct Event {
    /// Device that recorded this event
    pub device_id: DeviceId,
    /// Per-device sequence number, starting at 1
    pub seq: u64,
    /// Wall clock of the recording device
    pub wall_time: DateTime<Utc>,
    /// The mutation
    pub kind: EventKind,
}

impl Event {
    pub fn new(device_id: DeviceId, seq: u64, wall_time: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            device_id,
            seq,
            wall_time,
            kind,
        }
    }

    /// Sort key for canonical order
    pub fn canonical_key(&self) -> CanonicalKey {
        CanonicalKey {
            wall_time: self.wall_time,
            device_id: self.device_id.clone(),
            seq: self.seq,
        }
    }

    /// Borrowed version of the canonical key, for sorting without clones
    pub fn order_tuple(&self) -> (DateTime<Utc>, &str, u64) {
        (self.wall_time, &self.device_id, self.seq)
    }

    /// Encode as one segment line (without the trailing newline)
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<EventRecord> for Event {
    fn from(record: EventRecord) -> Self {
        Event {
            device_id: record.device_id,
            seq: record.seq,
            wall_time: record.wall_time,
            kind: EventKind::decode(record.kind, record.payload),
        }
    }
}

impl From<Event> for EventRecord {
    fn from(event: Event) -> Self {
        let (kind, payload) = event.kind.encode();
        EventRecord {
            device_id: event.device_id,
            seq: event.seq,
            wall_time: event.wall_time,
            kind,
            payload,
        }
    }
}

/// Sort events into canonical order in place
pub fn sort_canonical(events: &mut [Event]) {
    events.sort_by(|a, b| a.order_tuple().cmp(&b.order_tuple()));
}
