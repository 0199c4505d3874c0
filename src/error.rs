//! Run failures and the exit codes they map to.

use thiserror::Error;

use crate::lock::LockError;

pub const EXIT_SUCCESS: u8 = 0;
/// Destination or audit log unusable before the lock was taken
pub const EXIT_SETUP: u8 = 1;
/// Bad arguments or config file (clap also exits 2 on parse errors)
pub const EXIT_USAGE: u8 = 2;
pub const EXIT_LOCK: u8 = 3;
pub const EXIT_TRANSFER: u8 = 4;
/// Anything that fails after the lock is held, other than the transfer
pub const EXIT_OPERATIONAL: u8 = 5;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0:#}")]
    Usage(anyhow::Error),

    #[error("{0:#}")]
    Setup(anyhow::Error),

    #[error("cannot acquire lock: {0}")]
    Lock(#[from] LockError),

    #[error("transfer failed: {0:#}")]
    Transfer(anyhow::Error),

    #[error("{0:#}")]
    Operational(anyhow::Error),

    #[error("{failed} scheduled deletion(s) failed")]
    DeletionFailures { failed: usize },
}

impl RunError {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Usage(_) => EXIT_USAGE,
            RunError::Setup(_) => EXIT_SETUP,
            RunError::Lock(_) => EXIT_LOCK,
            RunError::Transfer(_) => EXIT_TRANSFER,
            RunError::Operational(_) | RunError::DeletionFailures { .. } => EXIT_OPERATIONAL,
        }
    }
}
