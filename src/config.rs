use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::pointer::CurrentPointer;
use crate::retention::{RetentionRule, RetentionRules};

/// Cross-platform location of the optional config file
pub struct ConfigManager;

impl ConfigManager {
    /// Get the configuration directory path following platform conventions:
    /// - Linux: $XDG_CONFIG_HOME/snapsync or ~/.config/snapsync
    /// - macOS: ~/Library/Application Support/snapsync
    pub fn config_dir() -> Result<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
                Ok(PathBuf::from(xdg_config).join("snapsync"))
            } else {
                let home = dirs::home_dir().context("Failed to get home directory")?;
                Ok(home.join(".config").join("snapsync"))
            }
        }

        #[cfg(target_os = "macos")]
        {
            let home = dirs::home_dir().context("Failed to get home directory")?;
            Ok(home.join("Library").join("Application Support").join("snapsync"))
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            let home = dirs::home_dir().context("Failed to get home directory")?;
            Ok(home.join(".snapsync"))
        }
    }

    /// Get the default config file path (config.toml)
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }
}

/// Settings that may come from `config.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Retention rules as `<days-past>,<days-spacing>` strings
    #[serde(default)]
    pub retain: Vec<String>,

    /// Remote-access prefix for the source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,

    /// rsync binary to invoke
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsync: Option<PathBuf>,

    /// Extra arguments passed to rsync before source and target
    #[serde(default)]
    pub rsync_args: Vec<String>,

    /// Release the lock when the transfer fails instead of leaving it held
    #[serde(default)]
    pub release_lock_on_transfer_failure: bool,
}

impl FileConfig {
    /// Load from an explicit path; the file must exist.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load from the default location, falling back to defaults if absent.
    pub fn load_default() -> Result<Self> {
        let path = ConfigManager::config_file_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }
}

/// Values given on the command line; `None`/empty means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub retain: Vec<RetentionRule>,
    pub dry_run: bool,
    pub remote: Option<String>,
    pub rsync: Option<PathBuf>,
    pub rsync_args: Vec<String>,
    pub release_lock_on_transfer_failure: bool,
}

/// Everything a run needs to know, fixed before the run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Name shared by the snapshots and the well-known files
    pub basename: String,
    pub rules: RetentionRules,
    pub dry_run: bool,
    pub remote: Option<String>,
    pub rsync_binary: PathBuf,
    pub rsync_args: Vec<String>,
    pub release_lock_on_transfer_failure: bool,
}

impl BackupConfig {
    /// Merge command-line values over file values.
    ///
    /// `--retain` on the command line replaces the file's rules entirely;
    /// other flags override individually.
    pub fn resolve(cli: CliOverrides, file: FileConfig) -> Result<Self> {
        let basename = basename_of(&cli.source)?;
        // rsync reads a relative --link-dest against the new snapshot, not the cwd.
        let destination = std::path::absolute(&cli.destination).with_context(|| {
            format!("Failed to resolve destination: {}", cli.destination.display())
        })?;

        let rules = if cli.retain.is_empty() {
            file.retain
                .iter()
                .map(|rule| rule.parse::<RetentionRule>())
                .collect::<Result<RetentionRules>>()?
        } else {
            RetentionRules::new(cli.retain)
        };

        let mut rsync_args = file.rsync_args;
        rsync_args.extend(cli.rsync_args);

        Ok(Self {
            source: cli.source,
            destination,
            basename,
            rules,
            dry_run: cli.dry_run,
            remote: cli.remote.or(file.remote),
            rsync_binary: cli.rsync.or(file.rsync).unwrap_or_else(|| PathBuf::from("rsync")),
            rsync_args,
            release_lock_on_transfer_failure: cli.release_lock_on_transfer_failure
                || file.release_lock_on_transfer_failure,
        })
    }

    pub fn paths(&self) -> Paths {
        Paths::new(&self.destination, &self.basename)
    }
}

/// Last normal component of the source path; trailing separators are ignored.
pub fn basename_of(source: &Path) -> Result<String> {
    let name = source
        .components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .last()
        .ok_or_else(|| anyhow!("Cannot derive a snapshot name from source '{}'", source.display()))?;

    let name = name
        .to_str()
        .ok_or_else(|| anyhow!("Source name is not valid UTF-8: '{}'", source.display()))?;
    Ok(name.to_string())
}

/// Well-known locations under a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    destination: PathBuf,
    basename: String,
}

impl Paths {
    pub fn new(destination: &Path, basename: &str) -> Self {
        Self {
            destination: destination.to_path_buf(),
            basename: basename.to_string(),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Prefix of snapshot directory names (without the `.` separator)
    pub fn prefix(&self) -> &str {
        &self.basename
    }

    pub fn lock_file(&self) -> PathBuf {
        self.destination.join(format!("lock.{}", self.basename))
    }

    pub fn current_link(&self) -> PathBuf {
        self.destination.join(format!("current.{}", self.basename))
    }

    pub fn current_staging(&self) -> PathBuf {
        self.destination.join(format!("current.{}.tmp", self.basename))
    }

    pub fn log_file(&self) -> PathBuf {
        self.destination.join(format!("log.{}", self.basename))
    }

    pub fn snapshot(&self, name: &str) -> PathBuf {
        self.destination.join(name)
    }

    pub fn current_pointer(&self) -> CurrentPointer {
        CurrentPointer::new(self.current_link(), self.current_staging())
    }
}
