//! boxsync CLI - boxsync command

use anyhow::Result;
use clap::{ArgAction, Parser};
use cli_lib::{logging, resolve_config, Daemon, DaemonOptions};
use std::path::PathBuf;

/// Synchronize a directory with a git branch
///
/// Changes in the directory are committed to the branch; pushes to the
/// branch are written back into the directory.
#[derive(Parser)]
#[command(name = "boxsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Folder to watch for changes
    folder: PathBuf,

    /// Git repository to synchronize
    repository: PathBuf,

    /// Git branch to synchronize (default: master)
    #[arg(short, long)]
    branch: Option<String>,

    /// Seconds to wait after the last change before committing (default: 5)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Increase verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Configuration file (default: <repository>/boxsync.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = logging::init(
        logging::level_for(cli.verbose, cli.quiet),
        cli.log_file.as_deref(),
    )?;

    let config = resolve_config(
        cli.config.as_deref(),
        &cli.repository,
        cli.branch,
        cli.timeout,
    )?;

    let daemon = Daemon::start(DaemonOptions {
        folder: cli.folder,
        repository: cli.repository,
        config,
    })?;
    daemon.run_until_interrupted().await
}
