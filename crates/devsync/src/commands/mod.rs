pub mod command;
pub mod config;
pub mod db;
pub mod device;
pub mod init;
pub mod project;
pub mod rebuild;
pub mod remote;
pub mod state;
pub mod sync;

use libdevsync_core::{DevsyncError, EventKind};
use serde::Serialize;
use crate::cli::Cli;
use crate::context::DevsyncContext;
use crate::output::output_with;

#[derive(Serialize)]
struct RecordedOutput {
    device_id: String,
    seq: u64,
    kind: String,
}

/// Record a mutation and report the event it became
fn record(cli: &Cli, ctx: &DevsyncContext, kind: EventKind, message: &str) -> Result<(), DevsyncError> {
    let name = kind.name().to_string();
    let seq = ctx.record(kind)?;
    output_with(
        cli,
        RecordedOutput { device_id: ctx.device_id().to_string(), seq, kind: name },
        |_| println!("{}", message),
    );
    Ok(())
}

fn non_empty(value: String, what: &str) -> Result<String, DevsyncError> {
    if value.trim().is_empty() {
        return Err(DevsyncError::InvalidArgs(format!("{} must not be empty", what)));
    }
    Ok(value)
}
