//! Autogit CLI - Command line interface for Autogit
//!
//! Clones and pulls repositories of a shared store into destination
//! directories, coordinating with other processes through lease files.

mod commands;

use std::path::PathBuf;

use autogit_core::Config;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::{DeleteArgs, StatusArgs, SyncArgs, SyncKind, WatchArgs};

/// Autogit: background clone/pull into a shared store
#[derive(Parser, Debug)]
#[command(name = "autogit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Number of sync workers (overrides config and env)
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Root of the shared store (overrides config and env)
    #[arg(long, global = true)]
    store_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show version information
    Version,

    /// Clone a source branch into a destination directory
    Clone(SyncArgs),

    /// Pull a source branch into an existing checkout
    Pull(SyncArgs),

    /// Delete a checkout
    #[command(visible_alias = "rm")]
    Delete(DeleteArgs),

    /// Show the state of a checkout
    Status(StatusArgs),

    /// Keep a namespace's repositories checked out until interrupted
    Watch(WatchArgs),

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    // Load configuration with overrides
    let config = Config::load_with_overrides(cli.workers, cli.store_root.clone())?;

    if cli.verbose {
        tracing::info!(
            workers = config.manager.workers,
            work_time_limit = ?config.manager.work_time_limit,
            store_root = ?config.store.root,
            "Configuration loaded"
        );
    }

    match cli.command {
        Some(Commands::Version) => {
            println!("autogit {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Clone(args)) => {
            args.execute(SyncKind::Clone, cli.verbose, &config).await?;
        }
        Some(Commands::Pull(args)) => {
            args.execute(SyncKind::Pull, cli.verbose, &config).await?;
        }
        Some(Commands::Delete(args)) => {
            args.execute(&config).await?;
        }
        Some(Commands::Status(args)) => {
            args.execute(&config).await?;
        }
        Some(Commands::Watch(args)) => {
            args.execute(cli.verbose, &config).await?;
        }
        Some(Commands::Config) => {
            println!("Autogit Configuration");
            println!("=====================");
            println!();
            println!("Manager Settings:");
            println!("  workers: {}", config.manager.workers);
            println!(
                "  work_time_limit: {}",
                humantime_serde::re::humantime::format_duration(config.manager.work_time_limit)
            );
            println!();
            println!("Store Settings:");
            println!("  root: {}", config.store.root_or_default()?.display());
            match &config.store.scratch_dir {
                Some(dir) => println!("  scratch_dir: {}", dir.display()),
                None => println!("  scratch_dir: (system temp dir)"),
            }
            println!();
            println!("Clock Settings:");
            match config.clock.offset_secs {
                Some(secs) => println!("  offset_secs: {}", secs),
                None => println!("  offset_secs: (unknown - using local time)"),
            }
            println!();
            if let Some(path) = Config::default_config_path() {
                println!("Config file: {}", path.display());
                if path.exists() {
                    println!("  (exists)");
                } else {
                    println!("  (not found - using defaults)");
                }
            }
        }
        None => {
            println!("Autogit - background clone/pull into a shared store");
            println!();
            println!("Use --help for usage information");
        }
    }

    Ok(())
}
