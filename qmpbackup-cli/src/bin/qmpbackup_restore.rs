//! Restore CLI (`qmpbackup-restore`): offline reconstruction of a
//! backup chain via `rebase`, `commit`, `merge`, or `snapshotrebase`.
//! Never touches the monitor; everything here drives
//! `qmpbackup_core::restore` against files already on disk.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use qmpbackup_cli::logging::LoggingConfig;
use qmpbackup_core::restore::{self, RestoreConfig, RestoreMode};
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "qmpbackup-restore", author, version, about = "Reconstruct a usable disk image from a qmpbackup chain", long_about = None)]
struct Cli {
    /// Skip the per-file consistency pre-check (enabled by default).
    #[arg(long, global = true)]
    skip_check: bool,

    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rewrite each increment's backing-file pointer onto its
    /// predecessor; leaves every file in place.
    Rebase(CommonArgs),
    /// Rebase, then commit every increment into the FULL.
    Commit(CommonArgs),
    /// Non-destructive commit into a copy; original chain is untouched.
    Merge(MergeArgs),
    /// Like commit, but snapshots the FULL before each step.
    Snapshotrebase(CommonArgs),
}

#[derive(Args)]
struct CommonArgs {
    #[arg(long)]
    dir: PathBuf,

    /// Stop the chain at this entry's filename (inclusive).
    #[arg(long)]
    until: Option<String>,

    #[arg(long)]
    dry_run: bool,

    /// Only entries whose filename contains this substring
    /// participate (the FULL root is always kept).
    #[arg(long)]
    filter: Option<String>,

    /// Bytes per second; forwarded only to the commit invocation.
    #[arg(long)]
    rate_limit: Option<u64>,
}

#[derive(Args)]
struct MergeArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long)]
    targetfile: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        verbosity: cli.verbose,
        log_file: cli.log_file.clone(),
        json: cli.log_json,
    };
    let _guard = logging.init().context("failed to initialize logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    match runtime.block_on(run(cli)) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("{e:#}");
            eprintln!("ERROR: {e}");
            std::process::exit(1);
        }
    }
}

fn into_config(common: CommonArgs, mode: RestoreMode, skip_check: bool, target_file: Option<PathBuf>) -> RestoreConfig {
    RestoreConfig {
        dir: common.dir,
        mode,
        until: common.until,
        filter: common.filter,
        rate_limit: common.rate_limit,
        target_file,
        skip_check,
        dry_run: common.dry_run,
        image_tool_binary: "qemu-img".to_string(),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let skip_check = cli.skip_check;

    let config = match cli.command {
        Command::Rebase(common) => into_config(common, RestoreMode::Rebase, skip_check, None),
        Command::Commit(common) => into_config(common, RestoreMode::Commit, skip_check, None),
        Command::Snapshotrebase(common) => into_config(common, RestoreMode::Snapshotrebase, skip_check, None),
        Command::Merge(args) => {
            let targetfile = args.targetfile.clone();
            into_config(args.common, RestoreMode::Merge, skip_check, Some(targetfile))
        }
    };

    let dry_run = config.dry_run;
    let report = restore::run(config).await?;

    eprintln!(
        "{:?} complete: {} entries processed, bootable tip {}{}",
        report.mode,
        report.entries_processed,
        report.bootable_tip.display(),
        if dry_run { " (dry run, no changes made)" } else { "" }
    );
    Ok(())
}
