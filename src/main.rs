use clap::Parser;
use colored::Colorize;
use log::LevelFilter;
use std::path::PathBuf;
use std::process::ExitCode;

use snapsync::backup::{Backup, RunReport};
use snapsync::config::{BackupConfig, CliOverrides, FileConfig};
use snapsync::error::RunError;
use snapsync::lock::{Acquisition, PsProbe};
use snapsync::logger::{self, AuditLog};
use snapsync::retention::RetentionRule;
use snapsync::transfer::RsyncTransfer;

#[derive(Parser)]
#[command(name = "snapsync")]
#[command(about = "Take a hard-linked rsync snapshot of a directory and prune old snapshots", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory to back up
    source: PathBuf,

    /// Directory holding the snapshots
    destination: PathBuf,

    /// Retention rule: within the last DAYS_PAST days keep one snapshot every
    /// DAYS_SPACING days. Repeatable; without any rule nothing is deleted
    #[arg(long = "retain", value_name = "DAYS_PAST,DAYS_SPACING")]
    retain: Vec<RetentionRule>,

    /// Report what would happen without changing anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Remote host prefix for the source, e.g. user@host
    #[arg(long, value_name = "HOST")]
    remote: Option<String>,

    /// rsync binary to use
    #[arg(long, value_name = "PATH")]
    rsync: Option<PathBuf>,

    /// Extra argument passed to rsync (repeatable)
    #[arg(long = "rsync-arg", value_name = "ARG", allow_hyphen_values = true)]
    rsync_args: Vec<String>,

    /// Config file (default: <config dir>/snapsync/config.toml, if present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Release the lock when the transfer fails instead of leaving it held
    #[arg(long)]
    release_lock_on_transfer_failure: bool,

    /// Show debug output
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only show warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else if cli.quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    logger::init_logger(level);

    let config = match build_config(cli) {
        Ok(config) => config,
        Err(e) => return fail(&e, None),
    };

    let transfer = RsyncTransfer::new(config.rsync_binary.clone(), config.rsync_args.clone());
    let probe = PsProbe;
    let backup = Backup::new(&config, &transfer, &probe);

    match backup.run(chrono::Local::now().fixed_offset()) {
        Ok(report) => {
            print_summary(&report);
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e, Some(&config)),
    }
}

fn build_config(cli: Cli) -> Result<BackupConfig, RunError> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path),
        None => FileConfig::load_default(),
    }
    .map_err(RunError::Usage)?;

    let overrides = CliOverrides {
        source: cli.source,
        destination: cli.destination,
        retain: cli.retain,
        dry_run: cli.dry_run,
        remote: cli.remote,
        rsync: cli.rsync,
        rsync_args: cli.rsync_args,
        release_lock_on_transfer_failure: cli.release_lock_on_transfer_failure,
    };

    BackupConfig::resolve(overrides, file).map_err(RunError::Usage)
}

/// Report a fatal error and make one last best-effort audit entry.
fn fail(error: &RunError, config: Option<&BackupConfig>) -> ExitCode {
    eprintln!("{} {}", "error:".red().bold(), error);

    // Best effort: a failing audit log must not change the exit code.
    if let Some(config) = config.filter(|config| config.destination.is_dir()) {
        let last_words = format!("Run failed (exit {}): {error}", error.exit_code());
        if let Err(e) = AuditLog::new(&config.paths().log_file(), config.dry_run).error(&last_words) {
            log::debug!("Could not write final audit entry: {e:#}");
        }
    }

    ExitCode::from(error.exit_code())
}

fn print_summary(report: &RunReport) {
    if report.dry_run {
        println!("{}", "Dry run: nothing was changed".yellow().bold());
        println!("  Would create {}", report.snapshot);
    } else {
        println!("{} Created {}", "✓".green(), report.snapshot.bold());
    }

    match &report.previous {
        Some(previous) => println!("  Linked against {previous}"),
        None => println!("  {}", "Full copy (no previous snapshot)".dimmed()),
    }

    if let Acquisition::Stolen { previous } = &report.lock {
        println!(
            "  {} Took over a stale lock from pid {}",
            "!".yellow(),
            previous.pid
        );
    }

    if report.deleted.is_empty() {
        println!("  {}", "No snapshots pruned".dimmed());
    } else {
        let verb = if report.dry_run { "Would prune" } else { "Pruned" };
        println!("  {} {} snapshot(s):", verb, report.deleted.len());
        for name in &report.deleted {
            println!("    - {name}");
        }
    }
}
