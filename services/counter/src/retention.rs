//! Day windows and retention of dedup records.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// Days a dedup bucket is kept (also the remote set TTL)
pub const RETENTION_DAYS: u32 = 8;

/// Day sets explicitly deleted by a remote reset
pub const RESET_LOOKBACK_DAYS: u32 = 10;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current UTC calendar day
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Format a day as `YYYY-MM-DD`
pub fn day_stamp(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Retention window for per-day dedup buckets
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    window_days: u32,
    reset_lookback_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            window_days: RETENTION_DAYS,
            reset_lookback_days: RESET_LOOKBACK_DAYS,
        }
    }
}

impl RetentionPolicy {
    /// Oldest day still retained
    pub fn cutoff(&self, today: NaiveDate) -> NaiveDate {
        today - Duration::days(i64::from(self.window_days))
    }

    /// TTL applied to remote day sets
    pub fn ttl_secs(&self) -> u64 {
        u64::from(self.window_days) * 24 * 60 * 60
    }

    /// Drop buckets older than the cutoff. Keys are `YYYY-MM-DD`, which sort
    /// chronologically, so a string comparison is enough.
    pub fn prune<V>(&self, days: &mut BTreeMap<String, V>, today: NaiveDate) -> usize {
        let cutoff = day_stamp(self.cutoff(today));
        let before = days.len();
        days.retain(|day, _| day.as_str() >= cutoff.as_str());
        let pruned = before - days.len();
        if pruned > 0 {
            debug!(pruned_days = pruned, cutoff = %cutoff, "Pruned stale dedup buckets");
        }
        pruned
    }

    /// Days covered by a remote reset, newest first
    pub fn reset_days(&self, today: NaiveDate) -> Vec<String> {
        (0..self.reset_lookback_days)
            .map(|i| day_stamp(today - Duration::days(i64::from(i))))
            .collect()
    }
}
