//! Strata Operator Executable
//!
//! Recovers a database directory and inspects its log.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use strata_core::storage::{DiskManager, WalManager};
use strata_core::{Config, StorageEngine, tx::read_log};
use tracing_subscriber::{filter::EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "strata", version, about = "Strata storage engine tool")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "strata.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open the database, undoing unfinished transactions
    Recover,
    /// Print log records, newest first
    DumpLog {
        /// Stop after this many records
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show block and log sizes
    Stats,
}

fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_from_path(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    let result = match cli.command {
        Command::Recover => recover(config),
        Command::DumpLog { limit } => dump_log(&config, limit),
        Command::Stats => stats(&config),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".bright_red(), e);
        std::process::exit(1);
    }
    Ok(())
}

fn recover(config: Config) -> anyhow::Result<()> {
    let data_dir = config.data_dir.clone();
    let engine = StorageEngine::open(config)
        .with_context(|| format!("opening database in {}", data_dir.display()))?;

    if engine.disk().is_new() {
        println!(
            "{} {}",
            "Created new database in".bright_green(),
            data_dir.display().to_string().bright_cyan()
        );
    } else {
        println!("{}", "Recovery complete".bright_green());
    }
    Ok(())
}

/// Open only the disk and log, so inspecting never runs recovery or writes
fn open_log(config: &Config) -> anyhow::Result<WalManager> {
    config.validate()?;
    if !config.data_dir.is_dir() {
        bail!("no database in {}", config.data_dir.display());
    }
    let log_path = config.data_dir.join(&config.log_file);
    if !log_path.is_file() {
        bail!("no log file at {}", log_path.display());
    }

    let disk = Arc::new(DiskManager::open_existing(&config.data_dir, config.block_size)?);
    WalManager::open_existing(disk, &config.log_file)
        .with_context(|| format!("opening log {}", log_path.display()))
}

fn dump_log(config: &Config, limit: Option<usize>) -> anyhow::Result<()> {
    let wal = open_log(config)?;
    let records = read_log(&wal)?;

    println!(
        "{} {} ({} records)",
        "Log".bright_green(),
        wal.log_file().bright_cyan(),
        records.len()
    );
    for record in records.iter().take(limit.unwrap_or(usize::MAX)) {
        println!("  {}", record);
    }
    Ok(())
}

fn stats(config: &Config) -> anyhow::Result<()> {
    let wal = open_log(config)?;

    println!("{}", "Strata database".bright_green());
    println!(
        "  Data Directory: {}",
        config.data_dir.display().to_string().bright_cyan()
    );
    println!(
        "  Block Size: {}",
        config.block_size.to_string().bright_cyan()
    );
    println!(
        "  Buffer Pool Size: {}",
        config.buffer_pool_size.to_string().bright_cyan()
    );
    println!(
        "  Max Wait: {}",
        format!("{:?}", config.max_wait()).bright_cyan()
    );
    println!(
        "  Log Blocks: {}",
        wal.block_count()?.to_string().bright_cyan()
    );
    println!(
        "  Current LSN: {}",
        wal.current_lsn().to_string().bright_cyan()
    );
    Ok(())
}
