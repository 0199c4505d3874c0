//! Snapshot directories on disk
//!
//! Naming, discovery and removal of the `<basename>.<timestamp>` directories
//! kept under a destination.

pub mod inventory;
pub mod remove;
pub mod timestamp;

pub use inventory::{list, SnapshotEntry};
pub use remove::remove_tree;

use chrono::{DateTime, FixedOffset, Utc};

/// Directory name for a snapshot of `basename` taken at `timestamp`.
pub fn snapshot_name(basename: &str, timestamp: DateTime<Utc>, offset: FixedOffset) -> String {
    format!("{}.{}", basename, timestamp::encode(timestamp, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_name_parses_back() {
        let t = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let offset = FixedOffset::east_opt(-4 * 3600).unwrap();
        let name = snapshot_name("photos", t, offset);

        assert_eq!(name, "photos.2024-05-06T03:08:09-04:00");
        let entry = SnapshotEntry::parse("photos", &name).unwrap();
        assert_eq!(entry.timestamp, t);
    }
}
