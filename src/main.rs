use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use resync::cli::{Cli, Commands, InitArgs, RunArgs};
use resync::core::cycle::SyncAgent;
use resync::core::git::GitOps;
use resync::infra::config;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Init(args) => init_config(args),
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn init_config(args: InitArgs) -> Result<()> {
    let path = config::init(&args.path, args.force)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn run(args: RunArgs) -> Result<()> {
    let cfg = config::load_config()?;

    let root = if let Some(repo) = args.repo {
        dunce::canonicalize(&repo)
            .with_context(|| format!("resolving --repo {}", repo.display()))?
    } else if let Some(configured) = cfg.expanded_repo_root()? {
        configured
    } else {
        std::env::current_dir().context("reading current directory")?
    };

    let git = GitOps::discover(&root).context("locating repository root")?;
    info!(root = %git.root().display(), "repository located");

    let agent = SyncAgent::new(cfg.clone(), git)?;

    if args.once {
        return agent.run_cycle();
    }

    info!(interval = ?cfg.sleep_interval(), "starting main loop");
    let mut consecutive_failures = 0u32;
    loop {
        match agent.run_cycle() {
            Ok(()) => {
                if consecutive_failures > 0 {
                    info!("cycle succeeded, resetting failure counter");
                    consecutive_failures = 0;
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                error!(
                    consecutive_failures,
                    max = cfg.max_consecutive_failures,
                    "cycle failed: {e:#}"
                );
                if consecutive_failures >= cfg.max_consecutive_failures {
                    let safe = cfg.sleep_interval() * cfg.safe_mode_multiplier;
                    warn!(sleep = ?safe, "too many consecutive failures, entering safe mode");
                    thread::sleep(safe);
                    consecutive_failures = 0;
                    continue;
                }
            }
        }
        thread::sleep(cfg.sleep_interval());
    }
}
