//! One backup run: lock, prune, transfer, repoint, prune, unlock.

use anyhow::{anyhow, Context};
use chrono::{DateTime, FixedOffset, SubsecRound, Utc};
use std::collections::BTreeSet;
use std::fs;

use crate::config::{BackupConfig, Paths};
use crate::error::RunError;
use crate::lock::{Acquisition, ProcessProbe, RunLock};
use crate::logger::AuditLog;
use crate::retention::decide_deletions;
use crate::snapshot::{self, snapshot_name, SnapshotEntry};
use crate::transfer::{link_dest_for, Transfer, TransferRequest};

/// Outcome of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Snapshot created (or that would have been, in a dry run)
    pub snapshot: String,
    /// Snapshot the current pointer named before the run
    pub previous: Option<String>,
    /// Snapshots removed by retention, in removal order
    pub deleted: Vec<String>,
    pub dry_run: bool,
    pub lock: Acquisition,
}

#[derive(Debug, Default)]
struct PruneState {
    attempted: BTreeSet<String>,
    deleted: Vec<String>,
    failed: usize,
}

/// A backup run wired to its collaborators
pub struct Backup<'a> {
    config: &'a BackupConfig,
    transfer: &'a dyn Transfer,
    probe: &'a dyn ProcessProbe,
}

fn operational<T>(result: anyhow::Result<T>) -> Result<T, RunError> {
    result.map_err(RunError::Operational)
}

impl<'a> Backup<'a> {
    pub fn new(
        config: &'a BackupConfig,
        transfer: &'a dyn Transfer,
        probe: &'a dyn ProcessProbe,
    ) -> Self {
        Self {
            config,
            transfer,
            probe,
        }
    }

    /// Run the backup as of `now`. The offset of `now` is the one written
    /// into the new snapshot's name.
    pub fn run(&self, now: DateTime<FixedOffset>) -> Result<RunReport, RunError> {
        let now = now.trunc_subsecs(0);
        let paths = self.config.paths();
        let audit = AuditLog::new(&paths.log_file(), self.config.dry_run);

        if !paths.destination().is_dir() {
            return Err(RunError::Setup(anyhow!(
                "Destination is not a directory: {}",
                paths.destination().display()
            )));
        }

        audit
            .info(&format!(
                "Starting backup of {} into {} (retention: {})",
                self.source_display(),
                paths.destination().display(),
                self.config.rules
            ))
            .map_err(RunError::Setup)?;

        let lock = match RunLock::acquire(
            &paths.lock_file(),
            self.probe,
            now.with_timezone(&Utc),
            self.config.dry_run,
        ) {
            Ok(lock) => lock,
            Err(e) => {
                let _ = audit.error(&format!("Cannot acquire lock: {e}"));
                return Err(e.into());
            }
        };

        let outcome = self.run_locked(&paths, &audit, &lock, now);

        let transfer_failed = matches!(outcome, Err(RunError::Transfer(_)));
        if transfer_failed && !self.config.release_lock_on_transfer_failure {
            let _ = audit.error(&format!(
                "Leaving {} in place; inspect the destination before the next run",
                lock.path().display()
            ));
            return outcome.map(|(report, _)| report);
        }

        let release = lock.release();
        let (report, failed) = match (outcome, release) {
            (Ok(ok), Ok(())) => ok,
            (Ok(_), Err(e)) => {
                let _ = audit.error(&e.to_string());
                return Err(RunError::Operational(anyhow!(e)));
            }
            (Err(e), release) => {
                if let Err(release_err) = release {
                    let _ = audit.error(&release_err.to_string());
                }
                return Err(e);
            }
        };

        if failed > 0 {
            let _ = audit.error(&format!("Finished with {failed} failed deletion(s)"));
            return Err(RunError::DeletionFailures { failed });
        }

        operational(audit.info(&format!("Backup {} finished", report.snapshot)))?;
        Ok(report)
    }

    fn run_locked(
        &self,
        paths: &Paths,
        audit: &AuditLog,
        lock: &RunLock,
        now: DateTime<FixedOffset>,
    ) -> Result<(RunReport, usize), RunError> {
        let dry_run = self.config.dry_run;
        let now_utc = now.with_timezone(&Utc);

        match lock.acquisition() {
            Acquisition::Fresh => operational(audit.info(&format!(
                "Acquired {} (pid {})",
                lock.path().display(),
                lock.record().pid
            )))?,
            Acquisition::Stolen { previous } => operational(audit.warn(&format!(
                "Took over stale {} from dead pid {} (acquired {})",
                lock.path().display(),
                previous.pid,
                previous.acquired_at
            )))?,
            Acquisition::Simulated { stale } => operational(audit.info(&match stale {
                Some(previous) => format!(
                    "Would take over stale {} from dead pid {}",
                    lock.path().display(),
                    previous.pid
                ),
                None => format!("Would acquire {}", lock.path().display()),
            }))?,
        }

        let pointer = paths.current_pointer();
        let previous = operational(pointer.read())?;
        match &previous {
            Some(name) => operational(audit.info(&format!("Current snapshot is {name}")))?,
            None => operational(audit.info("No current snapshot; this is a full copy"))?,
        }

        let mut state = PruneState::default();
        self.prune(paths, audit, previous.as_deref(), None, now_utc, &mut state)?;

        let name = snapshot_name(&self.config.basename, now_utc, *now.offset());
        let target = paths.snapshot(&name);
        if fs::symlink_metadata(&target).is_ok() {
            return Err(RunError::Operational(anyhow!(
                "Snapshot {} already exists",
                target.display()
            )));
        }

        let request = TransferRequest {
            source: self.config.source.clone(),
            target,
            link_dest: link_dest_for(paths.destination(), previous.as_deref()),
            remote: self.config.remote.clone(),
        };

        if dry_run {
            operational(audit.info(&format!("Would transfer into {name}")))?;
        } else {
            operational(audit.info(&format!("Transferring into {name}")))?;
            if let Err(e) = self.transfer.run(&request) {
                let _ = audit.error(&format!("Transfer into {name} failed: {e:#}"));
                return Err(RunError::Transfer(e));
            }
            operational(audit.info(&format!("Transfer into {name} complete")))?;
        }

        if dry_run {
            operational(audit.info(&format!(
                "Would point {} at {name}",
                pointer.link_path().display()
            )))?;
        } else {
            operational(
                pointer
                    .update(&name)
                    .with_context(|| format!("Failed to point current at {name}")),
            )?;
            operational(audit.info(&format!(
                "Pointed {} at {name}",
                pointer.link_path().display()
            )))?;
        }

        let created = SnapshotEntry {
            timestamp: now_utc,
            name: name.clone(),
        };
        self.prune(paths, audit, Some(&name), Some(&created), now_utc, &mut state)?;

        let report = RunReport {
            snapshot: name,
            previous,
            deleted: state.deleted,
            dry_run,
            lock: lock.acquisition().clone(),
        };
        Ok((report, state.failed))
    }

    /// One retention pass. `pending` stands in for a snapshot a dry run did
    /// not actually create.
    fn prune(
        &self,
        paths: &Paths,
        audit: &AuditLog,
        current: Option<&str>,
        pending: Option<&SnapshotEntry>,
        now: DateTime<Utc>,
        state: &mut PruneState,
    ) -> Result<(), RunError> {
        if self.config.rules.is_empty() {
            log::debug!("Retention disabled; keeping every snapshot");
            return Ok(());
        }

        let mut inventory = operational(snapshot::list(paths.destination(), paths.prefix()))?;
        inventory.retain(|entry| !state.attempted.contains(&entry.name));
        if let Some(pending) = pending.filter(|_| self.config.dry_run) {
            if !inventory.iter().any(|entry| entry.name == pending.name) {
                inventory.push(pending.clone());
                inventory.sort_by_key(|entry| entry.timestamp);
            }
        }

        if let Some(name) = current {
            if !inventory.iter().any(|entry| entry.name == name) {
                operational(audit.warn(&format!(
                    "Current snapshot {name} is not in the inventory; not pruning newer snapshots"
                )))?;
            }
        }

        let doomed = decide_deletions(&inventory, current, &self.config.rules, now);
        for name in doomed {
            state.attempted.insert(name.clone());
            let path = paths.snapshot(&name);

            if self.config.dry_run {
                operational(audit.info(&format!("Would delete {name}")))?;
                state.deleted.push(name);
                continue;
            }

            match snapshot::remove_tree(&path) {
                Ok(()) => {
                    operational(audit.info(&format!("Deleted {name}")))?;
                    state.deleted.push(name);
                }
                Err(e) => {
                    operational(audit.error(&format!("Failed to delete {name}: {e:#}")))?;
                    state.failed += 1;
                }
            }
        }

        Ok(())
    }

    fn source_display(&self) -> String {
        match &self.config.remote {
            Some(remote) => format!("{}:{}", remote, self.config.source.display()),
            None => self.config.source.display().to_string(),
        }
    }
}
