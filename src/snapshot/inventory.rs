use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;

use super::timestamp;

/// A snapshot directory found under the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Creation time, normalized to UTC
    pub timestamp: DateTime<Utc>,
    /// Directory name relative to the destination
    pub name: String,
}

impl SnapshotEntry {
    /// Build an entry from a directory name, if it follows `<prefix>.<timestamp>`
    pub fn parse(prefix: &str, name: &str) -> Option<Self> {
        let suffix = name.strip_prefix(prefix)?.strip_prefix('.')?;
        let timestamp = timestamp::decode(suffix)?;
        Some(Self {
            timestamp,
            name: name.to_string(),
        })
    }
}

/// List the snapshots of `prefix` under `directory`, oldest first.
///
/// Entries whose names do not follow the snapshot naming convention are
/// skipped silently. Names that are not valid UTF-8 cannot be snapshot names
/// and are skipped as well.
pub fn list(directory: &Path, prefix: &str) -> Result<Vec<SnapshotEntry>> {
    let entries = fs::read_dir(directory)
        .with_context(|| format!("Failed to list snapshot directory: {}", directory.display()))?;

    let mut snapshots = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("Failed to read entry in {}", directory.display()))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if let Some(snapshot) = SnapshotEntry::parse(prefix, &name) {
            snapshots.push(snapshot);
        }
    }

    snapshots.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.name.cmp(&b.name)));
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_list_filters_and_orders() {
        let temp = TempDir::new().unwrap();
        let names = [
            "home.2024-03-02T00:00:00+00:00",
            "home.2024-03-01T12:00:00-06:00", // 18:00 UTC on the 1st
            "home.2024-03-01T20:00:00+01:00", // 19:00 UTC on the 1st
            "home.not-a-timestamp",
            "homes.2024-03-01T00:00:00+00:00",
            "current.home",
            "lock.home",
            "log.home",
            "home2024-03-01T00:00:00+00:00",
        ];
        for name in names {
            fs::create_dir(temp.path().join(name)).unwrap();
        }

        let listed = list(temp.path(), "home").unwrap();
        let listed_names: Vec<_> = listed.iter().map(|e| e.name.as_str()).collect();

        assert_eq!(
            listed_names,
            vec![
                "home.2024-03-01T12:00:00-06:00",
                "home.2024-03-01T20:00:00+01:00",
                "home.2024-03-02T00:00:00+00:00",
            ]
        );
        assert_eq!(
            listed[0].timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_list_empty_directory() {
        let temp = TempDir::new().unwrap();
        assert!(list(temp.path(), "home").unwrap().is_empty());
    }

    #[test]
    fn test_list_missing_directory_fails() {
        let temp = TempDir::new().unwrap();
        let result = list(&temp.path().join("missing"), "home");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to list snapshot directory"));
    }

    #[test]
    fn test_parse_requires_separator() {
        assert!(SnapshotEntry::parse("home", "home.2024-03-01T00:00:00+00:00").is_some());
        assert!(SnapshotEntry::parse("home", "home-2024-03-01T00:00:00+00:00").is_none());
        assert!(SnapshotEntry::parse("home", "home.").is_none());
    }
}
