//! Exclusive run lock for a destination directory.
//!
//! The lock is a plain file created with `O_EXCL`. Its body records the owner
//! pid and acquisition time so a later run can tell a live owner from one that
//! died without cleaning up. A lock is only ever reclaimed when the liveness
//! probe says, unambiguously, that the recorded owner is gone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Contents of a lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn for_current_process(now: DateTime<Utc>) -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: now,
        }
    }
}

/// Answer of a process-liveness query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    NotFound,
    /// Anything that is not a clean yes or no
    Inconclusive(String),
}

/// Checks whether a process id belongs to a running process.
pub trait ProcessProbe {
    fn probe(&self, pid: u32) -> Liveness;
}

/// Liveness probe backed by `ps -p <pid>`.
#[derive(Debug, Default)]
pub struct PsProbe;

impl ProcessProbe for PsProbe {
    fn probe(&self, pid: u32) -> Liveness {
        match Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", "pid="])
            .output()
        {
            Ok(output) => classify_ps(pid, output.status.code(), &output.stdout, &output.stderr),
            Err(e) => Liveness::Inconclusive(format!("failed to run ps: {e}")),
        }
    }
}

/// Only a silent exit 1 means "no such process"; ps also exits 1 on its own errors.
fn classify_ps(pid: u32, code: Option<i32>, stdout: &[u8], stderr: &[u8]) -> Liveness {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    let listed = stdout
        .lines()
        .any(|line| line.trim().parse::<u32>().ok() == Some(pid));

    match code {
        Some(0) if listed => Liveness::Alive,
        Some(1) if stdout.trim().is_empty() && stderr.trim().is_empty() => Liveness::NotFound,
        Some(code) => Liveness::Inconclusive(format!("ps exited with {code}: {}", stderr.trim())),
        None => Liveness::Inconclusive("ps terminated by signal".to_string()),
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds the lock (pid {pid}, acquired {acquired_at})")]
    Contended { pid: u32, acquired_at: DateTime<Utc> },

    #[error("lock file {} is unreadable: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("cannot tell whether lock owner pid {pid} is alive: {detail}")]
    Inconclusive { pid: u32, detail: String },

    #[error("lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove lock file {}: {source}; remove it by hand before the next run", path.display())]
    ReleaseFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How the lock was obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// No lock file existed
    Fresh,
    /// A stale lock of a dead process was taken over
    Stolen { previous: LockRecord },
    /// Dry run: the lock would have been taken, nothing was written
    Simulated { stale: Option<LockRecord> },
}

/// A held run lock. Releasing is explicit; dropping leaves the file behind.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    record: LockRecord,
    acquisition: Acquisition,
}

impl RunLock {
    /// Take the lock at `path` for this process.
    ///
    /// With `dry_run` set the lock file is inspected but never created,
    /// stolen or removed. A live owner still fails the acquisition.
    pub fn acquire(
        path: &Path,
        probe: &dyn ProcessProbe,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<Self, LockError> {
        let record = LockRecord::for_current_process(now);

        if dry_run {
            let stale = match read_record(path)? {
                Some(existing) => Some(check_stale(existing, probe)?),
                None => None,
            };
            return Ok(Self {
                path: path.to_path_buf(),
                record,
                acquisition: Acquisition::Simulated { stale },
            });
        }

        let acquisition = match create_exclusive(path, &record) {
            Ok(()) => Acquisition::Fresh,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let existing = read_record(path)?.ok_or_else(|| LockError::Corrupt {
                    path: path.to_path_buf(),
                    reason: "lock file vanished while being inspected".to_string(),
                })?;
                let previous = check_stale(existing, probe)?;
                steal(path, &previous, &record)?;
                Acquisition::Stolen { previous }
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            record,
            acquisition,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn acquisition(&self) -> &Acquisition {
        &self.acquisition
    }

    /// Remove the lock file
    pub fn release(self) -> Result<(), LockError> {
        if matches!(self.acquisition, Acquisition::Simulated { .. }) {
            return Ok(());
        }
        fs::remove_file(&self.path).map_err(|source| LockError::ReleaseFailed {
            path: self.path.clone(),
            source,
        })
    }
}

/// Ok(record) when the owner is confirmed dead
fn check_stale(existing: LockRecord, probe: &dyn ProcessProbe) -> Result<LockRecord, LockError> {
    match probe.probe(existing.pid) {
        Liveness::NotFound => Ok(existing),
        Liveness::Alive => Err(LockError::Contended {
            pid: existing.pid,
            acquired_at: existing.acquired_at,
        }),
        Liveness::Inconclusive(detail) => Err(LockError::Inconclusive {
            pid: existing.pid,
            detail,
        }),
    }
}

fn create_exclusive(path: &Path, record: &LockRecord) -> io::Result<()> {
    create_new_with(path, |file| {
        file.write_all(&serialize(record)?)?;
        file.sync_all()
    })
}

/// Create `path` exclusively and fill it; a file that could not be filled is removed.
fn create_new_with<F>(path: &Path, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let filled = fill(&mut file);
    if filled.is_err() {
        drop(file);
        if let Err(e) = fs::remove_file(path) {
            log::warn!("Could not remove incomplete lock file {}: {e}", path.display());
        }
    }
    filled
}

/// Replace the lock of a dead owner with ours.
///
/// The stale file is renamed aside first, so of several runs that judged the
/// same owner dead only one moves that record. Whoever then wins `create_new`
/// holds the lock.
fn steal(path: &Path, stale: &LockRecord, record: &LockRecord) -> Result<(), LockError> {
    let io_err = |source: io::Error| LockError::Io {
        path: path.to_path_buf(),
        source,
    };
    let aside = aside_path(path);

    match fs::rename(path, &aside) {
        Ok(()) => match read_record(&aside) {
            Ok(Some(moved)) if moved == *stale => fs::remove_file(&aside).map_err(io_err)?,
            moved => {
                // Someone else's lock: put it back untouched.
                restore(&aside, path);
                return Err(match moved {
                    Ok(Some(other)) => LockError::Contended {
                        pid: other.pid,
                        acquired_at: other.acquired_at,
                    },
                    Ok(None) => LockError::Corrupt {
                        path: path.to_path_buf(),
                        reason: "lock file vanished during takeover".to_string(),
                    },
                    Err(e) => e,
                });
            }
        },
        // Already moved by another run; create_new decides.
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => return Err(io_err(source)),
    }

    match create_exclusive(path, record) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match read_record(path)? {
            Some(other) => Err(LockError::Contended {
                pid: other.pid,
                acquired_at: other.acquired_at,
            }),
            None => Err(LockError::Corrupt {
                path: path.to_path_buf(),
                reason: "lock file vanished during takeover".to_string(),
            }),
        },
        Err(source) => Err(io_err(source)),
    }
}

fn aside_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".stale.{}", std::process::id()));
    path.with_file_name(name)
}

/// Move a wrongly displaced lock back; hard_link never clobbers a newer one.
fn restore(aside: &Path, path: &Path) {
    if let Err(e) = fs::hard_link(aside, path) {
        log::warn!(
            "Could not restore lock file {} from {}: {e}",
            path.display(),
            aside.display()
        );
        return;
    }
    if let Err(e) = fs::remove_file(aside) {
        log::warn!("Could not remove {}: {e}", aside.display());
    }
}

fn read_record(path: &Path) -> Result<Option<LockRecord>, LockError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let record: LockRecord = serde_json::from_str(&content).map_err(|e| LockError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    // No process can own these; ps answers them with an error.
    if record.pid == 0 || i32::try_from(record.pid).is_err() {
        return Err(LockError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("{} is not a valid process id", record.pid),
        });
    }
    Ok(Some(record))
}

fn serialize(record: &LockRecord) -> io::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(record).map_err(io::Error::other)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct FixedProbe(Liveness);

    impl ProcessProbe for FixedProbe {
        fn probe(&self, _pid: u32) -> Liveness {
            self.0.clone()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap()
    }

    fn write_foreign_lock(path: &Path, pid: u32) -> String {
        let record = LockRecord {
            pid,
            acquired_at: Utc.with_ymd_and_hms(2024, 5, 31, 3, 0, 0).unwrap(),
        };
        let body = serde_json::to_string(&record).unwrap();
        fs::write(path, &body).unwrap();
        body
    }

    #[test]
    fn test_fresh_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock.home");

        let lock = RunLock::acquire(&path, &FixedProbe(Liveness::Alive), now(), false).unwrap();
        assert_eq!(lock.acquisition(), &Acquisition::Fresh);

        let on_disk: LockRecord = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.pid, std::process::id());
        assert_eq!(on_disk.acquired_at, now());

        lock.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_is_contended() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock.home");

        let _held = RunLock::acquire(&path, &FixedProbe(Liveness::Alive), now(), false).unwrap();
        let second = RunLock::acquire(&path, &FixedProbe(Liveness::Alive), now(), false);

        assert!(matches!(second, Err(LockError::Contended { .. })));
    }

    #[test]
    fn test_steals_lock_of_dead_process() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock.home");
        write_foreign_lock(&path, 4_000_000);

        let lock = RunLock::acquire(&path, &FixedProbe(Liveness::NotFound), now(), false).unwrap();

        match lock.acquisition() {
            Acquisition::Stolen { previous } => assert_eq!(previous.pid, 4_000_000),
            other => panic!("unexpected acquisition {other:?}"),
        }
        let on_disk: LockRecord = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, LockRecord::for_current_process(now()));
    }

    #[test]
    fn test_live_owner_leaves_file_untouched() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock.home");
        let body = write_foreign_lock(&path, 4_000_001);

        let result = RunLock::acquire(&path, &FixedProbe(Liveness::Alive), now(), false);

        assert!(matches!(result, Err(LockError::Contended { pid: 4_000_001, .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), body);
    }

    #[test]
    fn test_inconclusive_probe_is_fatal() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock.home");
        let body = write_foreign_lock(&path, 4_000_002);

        let probe = FixedProbe(Liveness::Inconclusive("permission denied".into()));
        let result = RunLock::acquire(&path, &probe, now(), false);

        assert!(matches!(result, Err(LockError::Inconclusive { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), body);
    }

    #[test]
    fn test_corrupt_record_is_fatal() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock.home");
        fs::write(&path, "12345\n").unwrap();

        let result = RunLock::acquire(&path, &FixedProbe(Liveness::NotFound), now(), false);

        assert!(matches!(result, Err(LockError::Corrupt { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), "12345\n");
    }

    #[test]
    fn test_dry_run_never_writes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock.home");

        let lock = RunLock::acquire(&path, &FixedProbe(Liveness::Alive), now(), true).unwrap();
        assert_eq!(lock.acquisition(), &Acquisition::Simulated { stale: None });
        assert!(!path.exists());
        lock.release().unwrap();

        let body = write_foreign_lock(&path, 4_000_003);
        let lock = RunLock::acquire(&path, &FixedProbe(Liveness::NotFound), now(), true).unwrap();
        assert!(matches!(lock.acquisition(), Acquisition::Simulated { stale: Some(_) }));
        lock.release().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), body);
    }

    #[test]
    fn test_dry_run_still_respects_live_owner() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock.home");
        write_foreign_lock(&path, 4_000_004);

        let result = RunLock::acquire(&path, &FixedProbe(Liveness::Alive), now(), true);
        assert!(matches!(result, Err(LockError::Contended { .. })));
    }

    #[test]
    fn test_release_of_missing_file_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock.home");

        let lock = RunLock::acquire(&path, &FixedProbe(Liveness::Alive), now(), false).unwrap();
        fs::remove_file(&path).unwrap();

        assert!(matches!(lock.release(), Err(LockError::ReleaseFailed { .. })));
    }

    /// Reports the owner dead, but lets another run act first.
    struct RacingProbe<F: Fn()>(F);

    impl<F: Fn()> ProcessProbe for RacingProbe<F> {
        fn probe(&self, _pid: u32) -> Liveness {
            (self.0)();
            Liveness::NotFound
        }
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name != "lock.home")
            .collect()
    }

    #[test]
    fn test_takeover_lost_to_another_run() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock.home");
        write_foreign_lock(&path, 4_000_005);

        let rival = Utc.with_ymd_and_hms(2024, 6, 1, 2, 59, 0).unwrap();
        let probe = RacingProbe(|| {
            let body = serde_json::to_string(&LockRecord {
                pid: 4_000_006,
                acquired_at: rival,
            })
            .unwrap();
            fs::write(&path, body).unwrap();
        });
        let result = RunLock::acquire(&path, &probe, now(), false);

        assert!(matches!(result, Err(LockError::Contended { pid: 4_000_006, .. })));
        let on_disk: LockRecord = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.pid, 4_000_006);
        assert!(leftovers(temp.path()).is_empty());
    }

    #[test]
    fn test_takeover_after_stale_lock_was_cleared() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock.home");
        write_foreign_lock(&path, 4_000_007);

        let probe = RacingProbe(|| fs::remove_file(&path).unwrap());
        let lock = RunLock::acquire(&path, &probe, now(), false).unwrap();

        assert!(matches!(lock.acquisition(), Acquisition::Stolen { .. }));
        let on_disk: LockRecord = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, LockRecord::for_current_process(now()));
        assert!(leftovers(temp.path()).is_empty());
    }

    #[test]
    fn test_stolen_lock_leaves_no_aside_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock.home");
        write_foreign_lock(&path, 4_000_008);

        RunLock::acquire(&path, &FixedProbe(Liveness::NotFound), now(), false).unwrap();

        assert!(leftovers(temp.path()).is_empty());
    }

    #[test]
    fn test_out_of_range_pids_are_corrupt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock.home");

        for pid in [0, u32::MAX, i32::MAX as u32 + 1] {
            let body = write_foreign_lock(&path, pid);
            let result = RunLock::acquire(&path, &PsProbe, now(), false);

            assert!(matches!(result, Err(LockError::Corrupt { .. })), "pid {pid}: {result:?}");
            assert_eq!(fs::read_to_string(&path).unwrap(), body);
        }
    }

    #[test]
    fn test_ps_errors_are_inconclusive() {
        let out_of_range = classify_ps(0, Some(1), b"", b"error: process ID out of range\n");
        assert!(matches!(out_of_range, Liveness::Inconclusive(detail) if detail.contains("out of range")));

        assert_eq!(classify_ps(42, Some(1), b"", b""), Liveness::NotFound);
        assert_eq!(classify_ps(42, Some(0), b"   42\n", b""), Liveness::Alive);
        assert!(matches!(classify_ps(42, Some(0), b"", b""), Liveness::Inconclusive(_)));
        assert!(matches!(classify_ps(42, None, b"", b""), Liveness::Inconclusive(_)));
    }

    #[test]
    fn test_unfilled_lock_file_is_removed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock.home");

        let result = create_new_with(&path, |file| {
            file.write_all(b"{\"pid\":")?;
            Err(io::Error::other("No space left on device"))
        });

        assert!(result.is_err());
        assert!(!path.exists());
        // The next run starts from a clean slate.
        RunLock::acquire(&path, &FixedProbe(Liveness::Alive), now(), false).unwrap();
    }

    #[test]
    fn test_ps_probe_sees_current_process() {
        // ps may be missing in minimal containers; only a positive answer is checked.
        let answer = PsProbe.probe(std::process::id());
        assert_ne!(answer, Liveness::NotFound);
    }
}
