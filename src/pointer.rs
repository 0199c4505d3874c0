use anyhow::{bail, Context, Result};
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

/// The `current.<basename>` symlink naming the latest completed snapshot.
///
/// The link target is the bare snapshot directory name, relative to the
/// destination, so a destination can be moved or mounted elsewhere.
#[derive(Debug, Clone)]
pub struct CurrentPointer {
    link: PathBuf,
    staging: PathBuf,
}

impl CurrentPointer {
    pub fn new(link: PathBuf, staging: PathBuf) -> Self {
        Self { link, staging }
    }

    pub fn link_path(&self) -> &Path {
        &self.link
    }

    /// Name of the snapshot the pointer resolves to, or `None` on a fresh
    /// destination. Anything other than a symlink at the link path is an error.
    pub fn read(&self) -> Result<Option<String>> {
        let metadata = match fs::symlink_metadata(&self.link) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to inspect current pointer: {}", self.link.display())
                })
            }
        };

        if !metadata.file_type().is_symlink() {
            bail!(
                "{} exists but is not a symbolic link; refusing to touch this destination",
                self.link.display()
            );
        }

        let target = fs::read_link(&self.link)
            .with_context(|| format!("Failed to read current pointer: {}", self.link.display()))?;
        let name = target
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| {
                format!(
                    "Current pointer {} has an unusable target: {}",
                    self.link.display(),
                    target.display()
                )
            })?;

        Ok(Some(name.to_string()))
    }

    /// Atomically repoint to `snapshot_name`.
    pub fn update(&self, snapshot_name: &str) -> Result<()> {
        self.stage(snapshot_name)?;
        self.commit()
    }

    /// Build the new link at the staging path. The live link is untouched
    /// until [`commit`](Self::commit).
    pub fn stage(&self, snapshot_name: &str) -> Result<()> {
        match fs::remove_file(&self.staging) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove stale staging link: {}", self.staging.display())
                })
            }
        }

        symlink(snapshot_name, &self.staging)
            .with_context(|| format!("Failed to create staging link: {}", self.staging.display()))
    }

    /// Rename the staged link over the live one.
    pub fn commit(&self) -> Result<()> {
        fs::rename(&self.staging, &self.link).with_context(|| {
            format!(
                "Failed to move {} over {}",
                self.staging.display(),
                self.link.display()
            )
        })
    }
}
