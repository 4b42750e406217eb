use libdevsync_core::{DevsyncError, EventKind};
use serde::Serialize;
use crate::cli::{Cli, ConfigCommand};
use crate::context::DevsyncContext;
use crate::output::output_with;
use super::{non_empty, record};

#[derive(Serialize)]
struct ConfigValueOutput {
    key: String,
    value: String,
}

pub fn run(cli: &Cli, cmd: ConfigCommand) -> Result<(), DevsyncError> {
    let ctx = DevsyncContext::resolve(cli)?;

    match cmd {
        ConfigCommand::Set { key, value } => {
            let message = format!("Set {} = {}", key, value);
            let kind = EventKind::SetConfig { key: non_empty(key, "config key")?, value };
            record(cli, &ctx, kind, &message)
        }
        ConfigCommand::Get { key } => {
            let state = ctx.replica.state()?;
            let value = state
                .config
                .get(&key)
                .cloned()
                .ok_or_else(|| DevsyncError::NotFound(format!("config key {}", key)))?;
            output_with(cli, ConfigValueOutput { key, value }, |out| println!("{}", out.value));
            Ok(())
        }
    }
}
