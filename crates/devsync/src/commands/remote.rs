use std::path::PathBuf;

use libdevsync_core::{DevsyncError, RemoteConfig};
use serde::Serialize;
use crate::cli::{Cli, RemoteCommand};
use crate::context::DevsyncContext;
use crate::output::output_with;

#[derive(Serialize)]
struct RemoteOutput {
    remote: Option<RemoteConfig>,
    describe: Option<String>,
}

pub fn run(cli: &Cli, cmd: RemoteCommand) -> Result<(), DevsyncError> {
    match cmd {
        RemoteCommand::Show => {
            let ctx = DevsyncContext::resolve(cli)?;
            show(cli, ctx.replica.config().remote.clone());
            Ok(())
        }
        RemoteCommand::SetDir { path } => set(cli, RemoteConfig::Dir { path: absolute(path)? }),
        RemoteCommand::SetGit { url, branch } => {
            if url.trim().is_empty() {
                return Err(DevsyncError::InvalidArgs("git URL must not be empty".to_string()));
            }
            set(cli, RemoteConfig::Git { url, branch })
        }
    }
}

fn set(cli: &Cli, remote: RemoteConfig) -> Result<(), DevsyncError> {
    let mut ctx = DevsyncContext::resolve(cli)?;
    let mut config = ctx.replica.config().clone();
    config.remote = Some(remote.clone());
    ctx.replica.save_config(config)?;
    show(cli, Some(remote));
    Ok(())
}

fn show(cli: &Cli, remote: Option<RemoteConfig>) {
    let describe = remote.as_ref().map(RemoteConfig::describe);
    output_with(cli, RemoteOutput { remote, describe }, |out| match &out.describe {
        Some(describe) => println!("{}", describe),
        None => println!("No remote configured"),
    });
}

/// Resolve a relative path against the working directory
fn absolute(path: PathBuf) -> Result<PathBuf, DevsyncError> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
