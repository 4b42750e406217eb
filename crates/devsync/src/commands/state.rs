use std::collections::BTreeMap;

use comfy_table::{presets::UTF8_FULL, Table};
use libdevsync_core::hash::{fingerprint_hex, state_fingerprint};
use libdevsync_core::{CommandEntry, DevsyncError, ProjectEntry};
use serde::Serialize;
use crate::cli::Cli;
use crate::context::DevsyncContext;
use crate::output::output_with;

#[derive(Serialize)]
struct StateOutput {
    device_id: String,
    projects: Vec<ProjectEntry>,
    commands: Vec<CommandEntry>,
    config: BTreeMap<String, String>,
    applied_events: u64,
    skipped_events: u64,
    fingerprint: String,
}

pub fn run(cli: &Cli, all: bool) -> Result<(), DevsyncError> {
    let ctx = DevsyncContext::resolve(cli)?;
    let state = ctx.replica.state()?;
    let fingerprint = fingerprint_hex(&state_fingerprint(&state)?);

    let projects: Vec<ProjectEntry> = if all {
        state.live_projects().cloned().collect()
    } else {
        state.projects_for(ctx.device_id()).cloned().collect()
    };
    let commands: Vec<CommandEntry> = if all {
        state.ordered_commands().into_iter().cloned().collect()
    } else {
        state.commands_for(ctx.device_id()).into_iter().cloned().collect()
    };

    let output = StateOutput {
        device_id: ctx.device_id().to_string(),
        projects,
        commands,
        config: state.config.clone(),
        applied_events: state.applied_count(),
        skipped_events: state.skipped,
        fingerprint,
    };

    output_with(cli, output, |out| print_tables(out, all));
    Ok(())
}

fn print_tables(out: &StateOutput, all: bool) {
    if out.projects.is_empty() {
        println!("No projects");
    } else {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        let mut header = vec!["#", "Project", "Repository"];
        if all {
            header.push("Device");
        }
        table.set_header(header);
        for project in &out.projects {
            let mut row = vec![
                project.display_order.to_string(),
                project.path.clone(),
                project.repo_url.clone().unwrap_or_default(),
            ];
            if all {
                row.push(project.device.clone());
            }
            table.add_row(row);
        }
        println!("{}", table);
    }

    if !out.commands.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        let mut header = vec!["#", "Command", "Runs"];
        if all {
            header.push("Device");
        }
        table.set_header(header);
        for command in &out.commands {
            let mut row = vec![
                command.display_order.to_string(),
                command.name.clone(),
                command.command.clone(),
            ];
            if all {
                row.push(command.device.clone());
            }
            table.add_row(row);
        }
        println!("{}", table);
    }

    if !out.config.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Setting", "Value"]);
        for (key, value) in &out.config {
            table.add_row(vec![key.as_str(), value.as_str()]);
        }
        println!("{}", table);
    }

    if out.skipped_events > 0 {
        println!("{} events skipped (unknown kind or bad payload)", out.skipped_events);
    }
}
