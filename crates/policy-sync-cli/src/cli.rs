use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use policy_sync_core::SyncMode;

#[derive(Parser)]
#[command(name = "policy-sync")]
#[command(about = "Reconcile policy-as-code definitions and assignments with the cloud resource manager")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "POLICY_SYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set (overrides config)
    #[arg(long, global = true, env = "POLICY_SYNC_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or update every changed policy object
    Sync(SyncArgs),
    /// Show what a sync would do without changing anything
    Plan(RunArgs),
    /// Inspect configuration
    Config(ConfigArgs),
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    /// Update objects whose content changed
    Incremental,
    /// Update every object
    Complete,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Incremental => SyncMode::Incremental,
            ModeArg::Complete => SyncMode::Complete,
        }
    }
}

/// Options shared by `sync` and `plan`.
#[derive(clap::Args, Default)]
pub struct RunArgs {
    /// Repository root (defaults to the current directory)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Glob patterns selecting policy directories; prefix with `!` to exclude
    #[arg(short, long, value_delimiter = ',')]
    pub paths: Vec<String>,

    /// Glob patterns for directories to skip
    #[arg(long, value_delimiter = ',')]
    pub ignore_paths: Vec<String>,

    /// File name patterns identifying assignment files
    #[arg(long, value_delimiter = ',')]
    pub assignments: Vec<String>,

    /// Assignment paths to enforce; prefix with `~` to disable enforcement
    #[arg(long, value_delimiter = ',')]
    pub enforce: Vec<String>,

    #[arg(long)]
    pub mode: Option<ModeArg>,

    /// Resource manager endpoint (otherwise taken from the Azure CLI)
    #[arg(long, env = "POLICY_SYNC_MANAGEMENT_URL")]
    pub management_url: Option<String>,

    /// Bearer token; when unset, one is requested from the Azure CLI
    #[arg(long, env = "POLICY_SYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[arg(long, env = "GITHUB_REPOSITORY")]
    pub repo_name: Option<String>,

    #[arg(long, env = "GITHUB_SHA")]
    pub commit_sha: Option<String>,

    #[arg(long, env = "GITHUB_SERVER_URL", hide = true)]
    pub server_url: Option<String>,

    #[arg(long, env = "GITHUB_RUN_ID", hide = true)]
    pub run_id: Option<String>,
}

#[derive(clap::Args)]
pub struct SyncArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Delete and recreate definitions whose in-place update is rejected
    #[arg(long, env = "POLICY_SYNC_FORCE_UPDATE")]
    pub force_update: bool,
}

#[derive(clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the configuration file merged with defaults
    Show,
}
