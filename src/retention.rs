use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::snapshot::SnapshotEntry;

/// "Within the last `lookback`, keep at least one snapshot every `spacing`."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionRule {
    /// How far back from now the rule applies
    pub lookback: Duration,
    /// Minimum gap between kept snapshots inside the window
    pub spacing: Duration,
}

impl RetentionRule {
    /// Rule expressed in whole days, as written on the command line
    pub fn days(days_past: u32, days_spacing: u32) -> Self {
        Self {
            lookback: Duration::days(i64::from(days_past)),
            spacing: Duration::days(i64::from(days_spacing)),
        }
    }

    fn covers(&self, age: Duration) -> bool {
        age < self.lookback
    }
}

impl FromStr for RetentionRule {
    type Err = anyhow::Error;

    /// Parse `<days-past>,<days-spacing>`, e.g. `7,1`
    fn from_str(s: &str) -> Result<Self> {
        let (past, spacing) = s
            .split_once(',')
            .ok_or_else(|| anyhow!("Invalid retention rule '{s}': expected <days-past>,<days-spacing>"))?;

        let past: u32 = past
            .trim()
            .parse()
            .with_context(|| format!("Invalid days-past in retention rule '{s}'"))?;
        let spacing: u32 = spacing
            .trim()
            .parse()
            .with_context(|| format!("Invalid days-spacing in retention rule '{s}'"))?;

        Ok(Self::days(past, spacing))
    }
}

impl fmt::Display for RetentionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lookback.num_days(), self.spacing.num_days())
    }
}

/// A set of retention rules. Empty means retention is disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionRules {
    rules: Vec<RetentionRule>,
}

impl RetentionRules {
    pub fn new(rules: Vec<RetentionRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Age beyond which nothing is kept
    pub fn horizon(&self) -> Duration {
        self.rules
            .iter()
            .map(|rule| rule.lookback)
            .max()
            .unwrap_or_else(Duration::zero)
            .max(Duration::zero())
    }

    /// Tightest spacing among the rules whose window covers `age`
    fn required_spacing(&self, age: Duration) -> Option<Duration> {
        self.rules
            .iter()
            .filter(|rule| rule.covers(age))
            .map(|rule| rule.spacing)
            .min()
    }
}

impl FromIterator<RetentionRule> for RetentionRules {
    fn from_iter<I: IntoIterator<Item = RetentionRule>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl fmt::Display for RetentionRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rules.is_empty() {
            return write!(f, "disabled");
        }
        let rendered: Vec<String> = self.rules.iter().map(ToString::to_string).collect();
        write!(f, "{}", rendered.join(" "))
    }
}

/// Compute which snapshots to delete.
///
/// `inventory` must be sorted oldest first, as returned by
/// [`crate::snapshot::list`]. `current` is the name the current pointer
/// resolves to, if any; it is never part of the result. If `current` is not
/// an inventory entry, nothing is treated as newer than current.
///
/// The decision is a pure function of its inputs.
pub fn decide_deletions(
    inventory: &[SnapshotEntry],
    current: Option<&str>,
    rules: &RetentionRules,
    now: DateTime<Utc>,
) -> BTreeSet<String> {
    let mut doomed = BTreeSet::new();
    if rules.is_empty() {
        return doomed;
    }

    // Orphans of interrupted runs: anything newer than current.
    let current_time = current
        .and_then(|name| inventory.iter().find(|entry| entry.name == name))
        .map(|entry| entry.timestamp);

    let horizon = rules.horizon();
    let mut candidates: Vec<&SnapshotEntry> = Vec::with_capacity(inventory.len());
    for entry in inventory {
        if current_time.is_some_and(|t| entry.timestamp > t) {
            doomed.insert(entry.name.clone());
        } else if now - entry.timestamp > horizon {
            doomed.insert(entry.name.clone());
        } else {
            candidates.push(entry);
        }
    }

    // Newest first; the newest survivor is the first anchor and the oldest
    // survivor only ever serves as the gap reference.
    candidates.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    if let Some((first, rest)) = candidates.split_first() {
        let mut anchor = *first;
        for pair in rest.windows(2) {
            let (candidate, next_older) = (pair[0], pair[1]);

            let keep = match rules.required_spacing(now - anchor.timestamp) {
                Some(spacing) => anchor.timestamp - next_older.timestamp >= spacing,
                None => false,
            };

            if keep {
                anchor = candidate;
            } else {
                doomed.insert(candidate.name.clone());
            }
        }
    }

    if let Some(name) = current {
        doomed.remove(name);
    }
    doomed
}
