//! Retention policy engine: existing snapshots + policy -> keep / prune.
//!
//! Чистая функция, без побочных эффектов; "now" передаётся явно.
//!
//! Алгоритм:
//! 1. сортировка по времени создания, новые первыми (равные timestamps: меньший id старше);
//! 2. `within` = длина префикса, удовлетворяющего max_age И max_count;
//! 3. оставляем первые `max(min_count, within)`;
//! 4. из хвоста исключаем `excluded` (смонтированные / создаваемые): они откладываются
//!    до следующего прогона.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::consts::{DEFAULT_MAX_COUNT, DEFAULT_MIN_COUNT};
use crate::provider::SnapshotHandle;
use crate::util::format_duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep at most N most recent snapshots (>= 1).
    pub max_count: usize,
    /// Discard snapshots older than this.
    pub max_age: Option<Duration>,
    /// Never prune below this floor. Wins over max_age/max_count.
    pub min_count: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_MAX_COUNT,
            max_age: None,
            min_count: DEFAULT_MIN_COUNT,
        }
    }
}

impl RetentionPolicy {
    pub fn new(max_count: usize, max_age: Option<Duration>, min_count: usize) -> Self {
        Self {
            max_count,
            max_age,
            min_count,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_count == 0 {
            return Err(anyhow!("retention.max_count must be >= 1"));
        }
        Ok(())
    }

    fn age_ok(&self, h: &SnapshotHandle, now: u64) -> bool {
        match self.max_age {
            None => true,
            Some(max) => now.saturating_sub(h.created_unix) <= max.as_secs(),
        }
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{max_count: {}, max_age: {}, min_count: {}}}",
            self.max_count,
            self.max_age
                .map(format_duration)
                .unwrap_or_else(|| "none".to_string()),
            self.min_count
        )
    }
}

/// Full decision, newest first in every list.
#[derive(Debug, Clone, Default)]
pub struct RetentionPlan {
    pub keep: Vec<SnapshotHandle>,
    /// Selected by policy and not excluded: to delete now.
    pub prune: Vec<SnapshotHandle>,
    /// Selected by policy but excluded (mounted / in flight): next run.
    pub deferred: Vec<SnapshotHandle>,
}

pub fn plan(
    existing: &[SnapshotHandle],
    policy: &RetentionPolicy,
    excluded: &HashSet<String>,
    now: u64,
) -> RetentionPlan {
    let mut sorted: Vec<SnapshotHandle> = existing.to_vec();
    sorted.sort_by(|a, b| b.age_key().cmp(&a.age_key()));

    let within = sorted
        .iter()
        .take(policy.max_count)
        .take_while(|h| policy.age_ok(h, now))
        .count();
    let keep_n = within.max(policy.min_count).min(sorted.len());

    let tail = sorted.split_off(keep_n);
    let (deferred, prune): (Vec<_>, Vec<_>) =
        tail.into_iter().partition(|h| excluded.contains(&h.id));

    RetentionPlan {
        keep: sorted,
        prune,
        deferred,
    }
}

/// Snapshots to delete, oldest first.
pub fn select_for_pruning(
    existing: &[SnapshotHandle],
    policy: &RetentionPolicy,
    excluded: &HashSet<String>,
    now: u64,
) -> Vec<SnapshotHandle> {
    let mut v = plan(existing, policy, excluded, now).prune;
    v.reverse();
    v
}
