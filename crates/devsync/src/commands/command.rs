use libdevsync_core::{DevsyncError, EventKind, OrderTarget};
use crate::cli::{Cli, CmdCommand};
use crate::context::DevsyncContext;
use super::{non_empty, record};

pub fn run(cli: &Cli, cmd: CmdCommand) -> Result<(), DevsyncError> {
    let ctx = DevsyncContext::resolve(cli)?;
    let scope = |this_device: bool| this_device.then(|| ctx.device_id().to_string());

    match cmd {
        CmdCommand::Add { this_device, name, command } => {
            let message = format!("Added command {}", name);
            let kind = EventKind::AddCommand {
                name: non_empty(name, "command name")?,
                command: non_empty(command.join(" "), "command line")?,
                device: scope(this_device),
            };
            record(cli, &ctx, kind, &message)
        }
        CmdCommand::Rm { name, this_device } => {
            let message = format!("Removed command {}", name);
            let kind = EventKind::RemoveCommand { name, device: scope(this_device) };
            record(cli, &ctx, kind, &message)
        }
        CmdCommand::Order { names } => {
            let kind = EventKind::Reorder { target: OrderTarget::Commands, order: names };
            record(cli, &ctx, kind, "Reordered commands")
        }
    }
}
