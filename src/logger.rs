use anyhow::{Context, Result};
use log::{Level, LevelFilter};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Initialize console logging
///
/// **Console logging** can be controlled via the `RUST_LOG` environment variable:
/// - `RUST_LOG=error` - Only errors
/// - `RUST_LOG=warn` - Warnings and errors
/// - `RUST_LOG=info` - Info, warnings, and errors (default)
/// - `RUST_LOG=debug` - Debug and above, including the rsync command line
///
/// `fallback` is used when `RUST_LOG` is unset or unparsable; `-v` and `-q`
/// pick it in `main`.
///
/// The audit trail under the destination is separate; see [`AuditLog`].
pub fn init_logger(fallback: LevelFilter) {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(fallback);

    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{:5}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter_level(level)
        .target(env_logger::Target::Stderr)
        .try_init()
        .ok(); // Ignore error if logger is already initialized
}

/// Append-only audit trail for one destination (`log.<basename>`).
///
/// Every record is also emitted through the `log` facade. A failed append is
/// returned to the caller: a run must not mutate the destination without
/// leaving a trace. In dry-run mode nothing is written to disk.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    dry_run: bool,
}

impl AuditLog {
    pub fn new(path: &Path, dry_run: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            dry_run,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: &str) -> Result<()> {
        self.record(Level::Info, message)
    }

    pub fn warn(&self, message: &str) -> Result<()> {
        self.record(Level::Warn, message)
    }

    pub fn error(&self, message: &str) -> Result<()> {
        self.record(Level::Error, message)
    }

    pub fn record(&self, level: Level, message: &str) -> Result<()> {
        if self.dry_run {
            log::log!(level, "[dry-run] {message}");
            return Ok(());
        }
        log::log!(level, "{message}");

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open log file: {}", self.path.display()))?;

        writeln!(
            file,
            "[{}] {:5} {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%:z"),
            level,
            message
        )
        .with_context(|| format!("Failed to write log file: {}", self.path.display()))?;

        Ok(())
    }
}
