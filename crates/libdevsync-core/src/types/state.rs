use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::event::CanonicalKey;
use super::ids::{DeviceId, WILDCARD_DEVICE};

/// A project row in the materialized view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    pub display_order: u32,
    /// Owning device id, or `*` for every device
    pub device: DeviceId,
    /// Set when the project was removed; cleared on resurrection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<CanonicalKey>,
}

impl ProjectEntry {
    pub fn is_live(&self) -> bool {
        self.removed.is_none()
    }

    pub fn is_wildcard(&self) -> bool {
        self.device == WILDCARD_DEVICE
    }

    /// Whether this entry is listed on `device`
    pub fn visible_on(&self, device: &str) -> bool {
        self.is_wildcard() || self.device == device
    }
}

/// A named command in the materialized view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub name: String,
    pub command: String,
    pub display_order: u32,
    /// Owning device id, or `*` for every device
    pub device: DeviceId,
}

impl CommandEntry {
    pub fn is_wildcard(&self) -> bool {
        self.device == WILDCARD_DEVICE
    }

    pub fn visible_on(&self, device: &str) -> bool {
        self.is_wildcard() || self.device == device
    }
}

/// Queryable local state derived from the event log.
///
/// Always a pure function of the events folded into it. The `frontier` and
/// `watermark` fields record how far the fold has progressed so a cached
/// copy can be caught up incrementally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedState {
    pub projects: Vec<ProjectEntry>,
    pub commands: Vec<CommandEntry>,
    pub config: BTreeMap<String, String>,
    /// Highest applied seq per device
    pub frontier: BTreeMap<DeviceId, u64>,
    /// Canonical key of the last applied event
    pub watermark: Option<CanonicalKey>,
    /// Events skipped because their kind or payload could not be decoded
    pub skipped: u64,
}

impl MaterializedState {
    /// Live projects in display order
    pub fn live_projects(&self) -> impl Iterator<Item = &ProjectEntry> {
        self.projects.iter().filter(|p| p.is_live())
    }

    /// Live projects visible on a given device, in display order
    pub fn projects_for<'a>(&'a self, device: &'a str) -> impl Iterator<Item = &'a ProjectEntry> + 'a {
        self.live_projects().filter(move |p| p.visible_on(device))
    }

    /// Commands sorted by display order, ties broken by name then device
    pub fn ordered_commands(&self) -> Vec<&CommandEntry> {
        let mut commands: Vec<&CommandEntry> = self.commands.iter().collect();
        commands.sort_by(|a, b| {
            (a.display_order, &a.name, &a.device).cmp(&(b.display_order, &b.name, &b.device))
        });
        commands
    }

    /// Commands visible on a given device, in display order
    pub fn commands_for(&self, device: &str) -> Vec<&CommandEntry> {
        let mut commands = self.ordered_commands();
        commands.retain(|c| c.visible_on(device));
        commands
    }

    /// Total number of events folded in
    pub fn applied_count(&self) -> u64 {
        self.frontier.values().sum()
    }

    pub fn live_project_count(&self) -> usize {
        self.live_projects().count()
    }
}
