//! Fold events into [`MaterializedState`]
//!
//! The fold is deterministic: given the same events in canonical order it
//! produces byte-identical state regardless of which device runs it.

use std::collections::HashSet;

use tracing::{trace, warn};

use crate::types::event::{CanonicalKey, Event, EventKind, OrderTarget};
use crate::types::ids::WILDCARD_DEVICE;
use crate::types::state::{CommandEntry, MaterializedState, ProjectEntry};

/// What `apply` did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event was folded into the state
    Applied,
    /// Already applied (seq at or below the device's frontier)
    Stale,
    /// Kind or payload not understood; counted and otherwise ignored
    Skipped,
    /// Sorts before the last applied event; the caller must replay from the log
    OutOfOrder,
}

/// Applies events to a materialized state
#[derive(Debug, Default)]
pub struct Materializer {
    state: MaterializedState,
    warned_kinds: HashSet<String>,
}

impl Materializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue folding on top of a cached state
    pub fn from_state(state: MaterializedState) -> Self {
        Self {
            state,
            warned_kinds: HashSet::new(),
        }
    }

    pub fn state(&self) -> &MaterializedState {
        &self.state
    }

    pub fn into_state(self) -> MaterializedState {
        self.state
    }

    /// Apply one event.
    ///
    /// `OutOfOrder` leaves the state untouched.
    pub fn apply(&mut self, event: &Event) -> ApplyOutcome {
        let applied_seq = self.state.frontier.get(&event.device_id).copied().unwrap_or(0);
        if event.seq <= applied_seq {
            return ApplyOutcome::Stale;
        }

        let key = event.canonical_key();
        if let Some(watermark) = &self.state.watermark {
            if key < *watermark {
                return ApplyOutcome::OutOfOrder;
            }
        }

        let outcome = match &event.kind {
            EventKind::AddProject { path, repo_url, device } => {
                let scope = device.as_deref().unwrap_or(WILDCARD_DEVICE);
                self.add_project(path, repo_url.as_deref(), scope);
                ApplyOutcome::Applied
            }
            EventKind::RemoveProject { path, device } => {
                self.remove_project(path, device.as_deref(), &key);
                ApplyOutcome::Applied
            }
            EventKind::SetConfig { key, value } => {
                self.state.config.insert(key.clone(), value.clone());
                ApplyOutcome::Applied
            }
            EventKind::AddCommand { name, command, device } => {
                let scope = device.as_deref().unwrap_or(WILDCARD_DEVICE);
                self.add_command(name, command, scope);
                ApplyOutcome::Applied
            }
            EventKind::RemoveCommand { name, device } => {
                let scope = device.as_deref();
                self.state
                    .commands
                    .retain(|c| c.name != *name || scope.is_some_and(|s| c.device != s));
                ApplyOutcome::Applied
            }
            EventKind::Reorder { target, order } => {
                match target {
                    OrderTarget::Projects => self.reorder_projects(order),
                    OrderTarget::Commands => self.reorder_commands(order),
                }
                ApplyOutcome::Applied
            }
            EventKind::Unknown { kind, .. } => {
                if self.warned_kinds.insert(kind.clone()) {
                    warn!(kind = %kind, device = %event.device_id, seq = event.seq, "skipping events of unknown kind");
                }
                self.state.skipped += 1;
                ApplyOutcome::Skipped
            }
        };

        trace!(device = %event.device_id, seq = event.seq, kind = event.kind.name(), ?outcome, "applied");
        self.state.frontier.insert(event.device_id.clone(), event.seq);
        self.state.watermark = Some(key);
        outcome
    }

    fn add_project(&mut self, path: &str, repo_url: Option<&str>, scope: &str) {
        let projects = &mut self.state.projects;

        let overlaps = |p: &ProjectEntry| {
            p.path == path && (p.device == scope || p.is_wildcard() || scope == WILDCARD_DEVICE)
        };
        if projects.iter().any(|p| p.is_live() && overlaps(p)) {
            return;
        }

        let display_order = next_order(projects.iter().map(|p| p.display_order));
        let entry = match projects.iter().position(|p| p.path == path && p.device == scope) {
            Some(index) => {
                let mut entry = projects.remove(index);
                entry.removed = None;
                entry.display_order = display_order;
                if repo_url.is_some() {
                    entry.repo_url = repo_url.map(str::to_string);
                }
                entry
            }
            None => ProjectEntry {
                path: path.to_string(),
                repo_url: repo_url.map(str::to_string),
                display_order,
                device: scope.to_string(),
                removed: None,
            },
        };
        projects.push(entry);
    }

    /// Same overlap rule as projects; no tombstones, a removed name is simply gone
    fn add_command(&mut self, name: &str, command: &str, scope: &str) {
        let commands = &mut self.state.commands;
        let overlaps = |c: &CommandEntry| {
            c.name == name && (c.device == scope || c.is_wildcard() || scope == WILDCARD_DEVICE)
        };
        if commands.iter().any(overlaps) {
            return;
        }
        let display_order = next_order(commands.iter().map(|c| c.display_order));
        commands.push(CommandEntry {
            name: name.to_string(),
            command: command.to_string(),
            display_order,
            device: scope.to_string(),
        });
    }

    fn remove_project(&mut self, path: &str, scope: Option<&str>, key: &CanonicalKey) {
        for project in self.state.projects.iter_mut() {
            if project.path != path || !project.is_live() {
                continue;
            }
            if scope.map_or(true, |s| project.device == s) {
                project.removed = Some(key.clone());
            }
        }
    }

    fn reorder_projects(&mut self, order: &[String]) {
        let mut remaining = std::mem::take(&mut self.state.projects);
        let mut reordered = Vec::with_capacity(remaining.len());
        for name in order {
            let (listed, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|p| &p.path == name);
            reordered.extend(listed);
            remaining = rest;
        }
        reordered.extend(remaining);
        for (index, project) in reordered.iter_mut().enumerate() {
            project.display_order = index as u32;
        }
        self.state.projects = reordered;
    }

    fn reorder_commands(&mut self, order: &[String]) {
        let mut remaining: Vec<CommandEntry> = self.state.ordered_commands().into_iter().cloned().collect();
        let mut reordered = Vec::with_capacity(remaining.len());
        for name in order {
            let (listed, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|c| &c.name == name);
            reordered.extend(listed);
            remaining = rest;
        }
        reordered.extend(remaining);
        for (index, command) in reordered.iter_mut().enumerate() {
            command.display_order = index as u32;
        }
        self.state.commands = reordered;
    }
}

fn next_order(orders: impl Iterator<Item = u32>) -> u32 {
    orders.max().map_or(0, |max| max + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    struct Clock {
        device: String,
        seq: u64,
    }

    impl Clock {
        fn new(device: &str) -> Self {
            Self {
                device: device.to_string(),
                seq: 0,
            }
        }

        fn at(&mut self, secs: i64, kind: EventKind) -> Event {
            self.seq += 1;
            Event::new(
                self.device.clone(),
                self.seq,
                Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
                kind,
            )
        }
    }

    fn add(path: &str, device: Option<&str>) -> EventKind {
        EventKind::AddProject {
            path: path.to_string(),
            repo_url: None,
            device: device.map(str::to_string),
        }
    }

    fn rm(path: &str, device: Option<&str>) -> EventKind {
        EventKind::RemoveProject {
            path: path.to_string(),
            device: device.map(str::to_string),
        }
    }

    fn cmd(name: &str, command: &str, device: Option<&str>) -> EventKind {
        EventKind::AddCommand {
            name: name.to_string(),
            command: command.to_string(),
            device: device.map(str::to_string),
        }
    }

    fn rm_cmd(name: &str, device: Option<&str>) -> EventKind {
        EventKind::RemoveCommand {
            name: name.to_string(),
            device: device.map(str::to_string),
        }
    }

    fn live_paths(state: &MaterializedState) -> Vec<&str> {
        state.live_projects().map(|p| p.path.as_str()).collect()
    }

    #[test]
    fn test_add_project_is_idempotent_per_path() {
        let mut a = Clock::new("a");
        let mut m = Materializer::new();
        m.apply(&a.at(0, add("/x", None)));
        m.apply(&a.at(1, add("/x", None)));
        m.apply(&a.at(2, add("/x", Some("laptop"))));
        assert_eq!(m.state().projects.len(), 1);
    }

    #[test]
    fn test_scoped_projects_coexist() {
        let mut a = Clock::new("a");
        let mut m = Materializer::new();
        m.apply(&a.at(0, add("/x", Some("laptop"))));
        m.apply(&a.at(1, add("/x", Some("desktop"))));
        assert_eq!(m.state().live_project_count(), 2);
        assert_eq!(m.state().projects_for("laptop").count(), 1);

        m.apply(&a.at(2, rm("/x", Some("laptop"))));
        assert_eq!(m.state().projects_for("laptop").count(), 0);
        assert_eq!(m.state().projects_for("desktop").count(), 1);
    }

    #[test]
    fn test_remove_then_add_resurrects_at_end() {
        let mut a = Clock::new("a");
        let mut m = Materializer::new();
        m.apply(&a.at(0, add("/x", None)));
        m.apply(&a.at(1, add("/y", None)));
        m.apply(&a.at(2, rm("/x", None)));
        assert_eq!(live_paths(m.state()), vec!["/y"]);

        m.apply(&a.at(3, add("/x", None)));
        assert_eq!(live_paths(m.state()), vec!["/y", "/x"]);
        assert_eq!(m.state().projects.len(), 2);
    }

    #[test]
    fn test_set_config_last_write_wins() {
        let mut a = Clock::new("a");
        let mut b = Clock::new("b");
        let mut m = Materializer::new();
        let set = |v: &str| EventKind::SetConfig {
            key: "theme".to_string(),
            value: v.to_string(),
        };
        m.apply(&a.at(0, set("light")));
        m.apply(&b.at(1, set("dark")));
        assert_eq!(m.state().config.get("theme").map(String::as_str), Some("dark"));
    }

    #[test]
    fn test_add_command_keeps_first_definition() {
        let mut a = Clock::new("a");
        let mut m = Materializer::new();
        m.apply(&a.at(0, cmd("build", "make", None)));
        m.apply(&a.at(1, cmd("build", "cargo build", None)));
        assert_eq!(m.state().commands.len(), 1);
        assert_eq!(m.state().commands[0].command, "make");

        m.apply(&a.at(2, rm_cmd("build", None)));
        m.apply(&a.at(3, cmd("build", "cargo build", None)));
        assert_eq!(m.state().commands[0].command, "cargo build");
    }

    #[test]
    fn test_scoped_commands_per_device() {
        let mut a = Clock::new("a");
        let mut m = Materializer::new();
        m.apply(&a.at(0, cmd("build", "make", Some("laptop"))));
        m.apply(&a.at(1, cmd("build", "ninja", Some("desktop"))));
        m.apply(&a.at(2, cmd("build", "cargo build", None)));
        assert_eq!(m.state().commands.len(), 2);

        let on = |device: &str| -> Vec<String> {
            m.state().commands_for(device).into_iter().map(|c| c.command.clone()).collect()
        };
        assert_eq!(on("laptop"), vec!["make"]);
        assert_eq!(on("desktop"), vec!["ninja"]);
        assert!(on("phone").is_empty());

        m.apply(&a.at(3, rm_cmd("build", Some("laptop"))));
        assert!(m.state().commands_for("laptop").is_empty());
        assert_eq!(m.state().commands_for("desktop").len(), 1);

        m.apply(&a.at(4, rm_cmd("build", None)));
        assert!(m.state().commands.is_empty());
    }

    #[test]
    fn test_reorder_keeps_unlisted_after_listed() {
        let mut a = Clock::new("a");
        let mut m = Materializer::new();
        for (i, p) in ["/a", "/b", "/c", "/d"].iter().enumerate() {
            m.apply(&a.at(i as i64, add(p, None)));
        }
        m.apply(&a.at(10, EventKind::Reorder {
            target: OrderTarget::Projects,
            order: vec!["/c".to_string(), "/a".to_string(), "/missing".to_string()],
        }));

        assert_eq!(live_paths(m.state()), vec!["/c", "/a", "/b", "/d"]);
        let orders: Vec<u32> = m.state().projects.iter().map(|p| p.display_order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_reorder_commands() {
        let mut a = Clock::new("a");
        let mut m = Materializer::new();
        for (i, name) in ["x", "y", "z"].iter().enumerate() {
            m.apply(&a.at(i as i64, cmd(name, "true", None)));
        }
        m.apply(&a.at(5, EventKind::Reorder {
            target: OrderTarget::Commands,
            order: vec!["z".to_string()],
        }));
        let names: Vec<&str> = m.state().ordered_commands().into_iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["z", "x", "y"]);
    }

    #[test]
    fn test_unknown_kind_is_counted_and_advances_frontier() {
        let mut a = Clock::new("a");
        let mut m = Materializer::new();
        let unknown = EventKind::Unknown {
            kind: "pin_project".to_string(),
            payload: serde_json::json!({"path": "/x"}),
        };
        assert_eq!(m.apply(&a.at(0, unknown.clone())), ApplyOutcome::Skipped);
        assert_eq!(m.apply(&a.at(1, unknown)), ApplyOutcome::Skipped);
        assert_eq!(m.state().skipped, 2);
        assert_eq!(m.state().frontier.get("a"), Some(&2));
    }

    #[test]
    fn test_stale_and_out_of_order() {
        let mut a = Clock::new("a");
        let mut b = Clock::new("b");
        let first = a.at(10, add("/x", None));
        let early = b.at(5, add("/y", None));

        let mut m = Materializer::new();
        assert_eq!(m.apply(&first), ApplyOutcome::Applied);
        assert_eq!(m.apply(&first), ApplyOutcome::Stale);

        let before = m.state().clone();
        assert_eq!(m.apply(&early), ApplyOutcome::OutOfOrder);
        assert_eq!(m.state(), &before);
    }
}
