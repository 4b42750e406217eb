use libdevsync_core::{DevsyncError, EventKind, OrderTarget};
use crate::cli::{Cli, ProjectCommand};
use crate::context::DevsyncContext;
use super::{non_empty, record};

pub fn run(cli: &Cli, cmd: ProjectCommand) -> Result<(), DevsyncError> {
    let ctx = DevsyncContext::resolve(cli)?;
    // --this-device scopes the entry to this device; otherwise it applies everywhere
    let scope = |this_device: bool| this_device.then(|| ctx.device_id().to_string());

    match cmd {
        ProjectCommand::Add { path, repo_url, this_device } => {
            let message = format!("Added project {}", path);
            let kind = EventKind::AddProject {
                path: non_empty(path, "project path")?,
                repo_url,
                device: scope(this_device),
            };
            record(cli, &ctx, kind, &message)
        }
        ProjectCommand::Rm { path, this_device } => {
            let message = format!("Removed project {}", path);
            let kind = EventKind::RemoveProject {
                path: non_empty(path, "project path")?,
                device: scope(this_device),
            };
            record(cli, &ctx, kind, &message)
        }
        ProjectCommand::Order { paths } => {
            let kind = EventKind::Reorder { target: OrderTarget::Projects, order: paths };
            record(cli, &ctx, kind, "Reordered projects")
        }
    }
}
