use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "resyncd")]
#[command(
    about = "Continuous git reconciliation agent with embedded-repository virtualization"
)]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug-level logging
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sync agent
    Run(RunArgs),

    /// Initialize a resync.toml config file
    Init(InitArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Run a single cycle and exit instead of looping
    #[arg(long)]
    pub once: bool,

    /// Repository root (overrides config; discovered via git when unset)
    #[arg(long)]
    pub repo: Option<PathBuf>,
}

#[derive(Args)]
pub struct InitArgs {
    /// Directory to create the config file in
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}
