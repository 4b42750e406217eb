use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "devsync", about = "Offline-first sync of projects, commands and settings", version)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress human-readable output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Override the data directory
    #[arg(long, global = true, env = "DEVSYNC_HOME")]
    pub data_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Set up this device's data directory
    Init {
        /// Device ID to use (generated if omitted)
        #[arg(long)]
        device_id: Option<String>,

        /// Human-friendly label for the device
        #[arg(long)]
        label: Option<String>,
    },

    /// Device identity and sync bookkeeping
    Device {
        #[command(subcommand)]
        cmd: DeviceCommand,
    },

    /// Configure the shared remote
    Remote {
        #[command(subcommand)]
        cmd: RemoteCommand,
    },

    /// Tracked projects
    Project {
        #[command(subcommand)]
        cmd: ProjectCommand,
    },

    /// Named commands
    #[command(name = "command")]
    Cmd {
        #[command(subcommand)]
        cmd: CmdCommand,
    },

    /// Shared settings
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },

    /// Show the current state
    State {
        /// Include projects and commands that belong to other devices
        #[arg(long)]
        all: bool,
    },

    /// Send local events to the remote
    Push,

    /// Fetch other devices' events from the remote
    Pull,

    /// Pull then push
    Sync,

    /// Recompute the state cache from the event log
    Rebuild {
        /// Pull first, re-fetching segments missing locally such as quarantined ones
        #[arg(long)]
        resync: bool,
    },

    /// State cache and log maintenance
    Db {
        #[command(subcommand)]
        cmd: DbCommand,
    },
}

#[derive(Clone, Subcommand)]
pub enum DeviceCommand {
    /// Show this device
    Show,

    /// List every device seen in the log
    List,
}

#[derive(Clone, Subcommand)]
pub enum RemoteCommand {
    /// Show the configured remote
    Show,

    /// Sync through a shared directory
    SetDir {
        /// Directory every device can reach
        path: PathBuf,
    },

    /// Sync through a git repository
    SetGit {
        /// Repository URL or path
        url: String,

        /// Branch holding the event segments
        #[arg(long, default_value = "main")]
        branch: String,
    },
}

#[derive(Clone, Subcommand)]
pub enum ProjectCommand {
    /// Track a project
    Add {
        /// Project path
        path: String,

        /// Repository to clone it from
        #[arg(long)]
        repo_url: Option<String>,

        /// Only list the project on this device
        #[arg(long)]
        this_device: bool,
    },

    /// Stop tracking a project
    Rm {
        path: String,

        /// Only remove this device's entry
        #[arg(long)]
        this_device: bool,
    },

    /// Move projects to the front in the given order
    Order {
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

#[derive(Clone, Subcommand)]
pub enum CmdCommand {
    /// Add a named command (no-op if the name exists; rm it first to change it)
    Add {
        /// Only offer the command on this device
        #[arg(long)]
        this_device: bool,

        name: String,

        /// Command line to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Remove a named command
    Rm {
        name: String,

        /// Only remove this device's entry
        #[arg(long)]
        this_device: bool,
    },

    /// Move commands to the front in the given order
    Order {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Clone, Subcommand)]
pub enum ConfigCommand {
    /// Set a shared setting
    Set { key: String, value: String },

    /// Print a shared setting
    Get { key: String },
}

#[derive(Clone, Subcommand)]
pub enum DbCommand {
    /// Show cache statistics
    Stats,

    /// Check every segment for corruption and gaps
    Check,

    /// Compare the cache with a fresh replay of the log
    Verify,

    /// Move a corrupt segment aside and rebuild
    Quarantine {
        /// Device whose segment to quarantine
        device: String,
    },
}
