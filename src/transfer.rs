//! The external copy step.
//!
//! A transfer copies the source tree into a new snapshot directory. When a
//! previous snapshot is given, unchanged files are hard-linked against it
//! instead of copied.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// One transfer into a fresh snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Source directory, local to the host named by `remote` if any
    pub source: PathBuf,
    /// Snapshot directory to create
    pub target: PathBuf,
    /// Existing snapshot to hard-link unchanged files against
    pub link_dest: Option<PathBuf>,
    /// Remote-access prefix, e.g. `backup@fileserver`
    pub remote: Option<String>,
}

/// Something that can perform a [`TransferRequest`] to completion.
pub trait Transfer {
    fn run(&self, request: &TransferRequest) -> Result<()>;
}

/// Transfer by invoking rsync in archive mode.
#[derive(Debug, Clone)]
pub struct RsyncTransfer {
    binary: PathBuf,
    extra_args: Vec<String>,
}

impl RsyncTransfer {
    pub fn new(binary: impl Into<PathBuf>, extra_args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_args,
        }
    }

    /// Command-line arguments for `request`, without the binary
    pub fn arguments(&self, request: &TransferRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-a".into()];

        if let Some(link_dest) = &request.link_dest {
            let mut arg = OsString::from("--link-dest=");
            arg.push(link_dest);
            args.push(arg);
        }

        args.extend(self.extra_args.iter().map(OsString::from));

        // Trailing slash: copy the contents of the source, not the directory.
        let mut source = OsString::new();
        if let Some(remote) = &request.remote {
            source.push(remote);
            source.push(":");
        }
        source.push(&request.source);
        if !source.to_string_lossy().ends_with('/') {
            source.push("/");
        }
        args.push(source);
        args.push(request.target.clone().into_os_string());

        args
    }

    fn describe(&self, request: &TransferRequest) -> String {
        let mut parts = vec![self.binary.display().to_string()];
        parts.extend(
            self.arguments(request)
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl Default for RsyncTransfer {
    fn default() -> Self {
        Self::new("rsync", Vec::new())
    }
}

impl Transfer for RsyncTransfer {
    fn run(&self, request: &TransferRequest) -> Result<()> {
        log::debug!("Running: {}", self.describe(request));

        let status = Command::new(&self.binary)
            .args(self.arguments(request))
            .status()
            .with_context(|| format!("Failed to run '{}'", self.binary.display()))?;

        if status.success() {
            return Ok(());
        }
        match (status.code(), status.signal()) {
            (Some(code), _) => bail!("{} exited with status {}", self.binary.display(), code),
            (None, Some(signal)) => {
                bail!("{} was terminated by signal {}", self.binary.display(), signal)
            }
            (None, None) => bail!("{} failed: {}", self.binary.display(), status),
        }
    }
}

/// Path of the snapshot to link against, if the destination has one.
pub fn link_dest_for(destination: &Path, current: Option<&str>) -> Option<PathBuf> {
    current.map(|name| destination.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TransferRequest {
        TransferRequest {
            source: PathBuf::from("/home/alice"),
            target: PathBuf::from("/backup/alice.2024-01-02T00:00:00+00:00"),
            link_dest: None,
            remote: None,
        }
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_minimal_arguments() {
        let args = strings(RsyncTransfer::default().arguments(&request()));
        assert_eq!(
            args,
            vec!["-a", "/home/alice/", "/backup/alice.2024-01-02T00:00:00+00:00"]
        );
    }

    #[test]
    fn test_link_dest_remote_and_extra_args() {
        let transfer = RsyncTransfer::new("rsync", vec!["--delete".into(), "-H".into()]);
        let request = TransferRequest {
            link_dest: Some(PathBuf::from("/backup/alice.2024-01-01T00:00:00+00:00")),
            remote: Some("alice@laptop".into()),
            source: PathBuf::from("/home/alice/"),
            ..request()
        };

        let args = strings(transfer.arguments(&request));

        assert_eq!(
            args,
            vec![
                "-a",
                "--link-dest=/backup/alice.2024-01-01T00:00:00+00:00",
                "--delete",
                "-H",
                "alice@laptop:/home/alice/",
                "/backup/alice.2024-01-02T00:00:00+00:00",
            ]
        );
    }

    #[test]
    fn test_link_dest_for() {
        assert_eq!(link_dest_for(Path::new("/backup"), None), None);
        assert_eq!(
            link_dest_for(Path::new("/backup"), Some("alice.x")),
            Some(PathBuf::from("/backup/alice.x"))
        );
    }

    #[test]
    fn test_nonzero_exit_is_failure() {
        let transfer = RsyncTransfer::new("false", Vec::new());
        let err = transfer.run(&request()).unwrap_err();
        assert!(err.to_string().contains("exited with status 1"));
    }

    #[test]
    fn test_missing_binary_is_failure() {
        let transfer = RsyncTransfer::new("/nonexistent/rsync", Vec::new());
        assert!(transfer.run(&request()).is_err());
    }
}
