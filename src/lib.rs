//! # snapsync
//!
//! A command-line tool for taking timestamped, hard-linked snapshots of a
//! directory with rsync and thinning them out according to a retention policy.
//!
//! ## Overview
//!
//! Each run copies one source directory into a new `<basename>.<timestamp>`
//! directory under a destination. Files that did not change since the previous
//! snapshot are hard-linked against it, so every snapshot is a complete tree
//! while only changed files cost space. A `current.<basename>` symlink always
//! names the last snapshot that completed successfully.
//!
//! ## Key Features
//!
//! - **Retention rules**: `<days-past>,<days-spacing>` pairs, e.g. keep one
//!   snapshot per day for a week and one per month for a year
//! - **Orphan cleanup**: snapshots newer than `current` (interrupted runs) are
//!   removed on the next run
//! - **Safe concurrency**: a lock file per destination, with takeover of locks
//!   left behind by dead processes
//! - **Atomic pointer update**: `current` flips via rename, never half-written
//! - **Dry run**: report every action without touching the destination
//!
//! ## Architecture
//!
//! - Snapshot naming, discovery and removal ([`snapshot`])
//! - Deletion decisions ([`retention`])
//! - Cross-run exclusion ([`lock`]) and the current pointer ([`pointer`])
//! - The rsync step ([`transfer`])
//! - Configuration, logging and errors ([`config`], [`logger`], [`error`])
//! - The run itself ([`backup`])

/// Run orchestration.
///
/// Ties the pieces together in order: acquire the lock, read the current
/// pointer, prune, transfer, repoint, prune again, release the lock.
pub mod backup;

/// Immutable run configuration.
///
/// Merges command-line values over an optional TOML config file and derives
/// the well-known paths under the destination.
pub mod config;

/// Run failures and exit codes.
pub mod error;

/// Exclusive run lock with stale-lock recovery.
///
/// The lock file names its owner's pid; a lock whose owner is verifiably
/// dead is taken over, anything ambiguous is fatal.
pub mod lock;

/// Console logging and the per-destination audit log.
pub mod logger;

/// The `current.<basename>` symlink.
pub mod pointer;

/// Retention rules and the deletion decision engine.
///
/// Pure computation over a snapshot inventory: given the rules, the current
/// snapshot and the time, decides which snapshots may go.
pub mod retention;

/// Snapshot directories: name encoding, listing and recursive removal.
pub mod snapshot;

/// The external transfer step (rsync).
pub mod transfer;
