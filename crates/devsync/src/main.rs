mod cli;
mod commands;
mod context;
mod output;

use clap::Parser;
use cli::{Cli, Command};
use libdevsync_core::DevsyncError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so --json output stays parseable
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run_command(&cli) {
        output::output_error(&cli, &e);
        std::process::exit(e.exit_code());
    }
}

fn run_command(cli: &Cli) -> Result<(), DevsyncError> {
    match &cli.command {
        Command::Init { device_id, label } => commands::init::run(cli, device_id.clone(), label.clone()),
        Command::Device { cmd } => commands::device::run(cli, cmd.clone()),
        Command::Remote { cmd } => commands::remote::run(cli, cmd.clone()),
        Command::Project { cmd } => commands::project::run(cli, cmd.clone()),
        Command::Cmd { cmd } => commands::command::run(cli, cmd.clone()),
        Command::Config { cmd } => commands::config::run(cli, cmd.clone()),
        Command::State { all } => commands::state::run(cli, *all),
        Command::Push => commands::sync::run_push(cli),
        Command::Pull => commands::sync::run_pull(cli),
        Command::Sync => commands::sync::run_sync(cli),
        Command::Rebuild { resync } => commands::rebuild::run(cli, *resync),
        Command::Db { cmd } => commands::db::run(cli, cmd.clone()),
    }
}
