//! Storage backends for counter state.
//!
//! ## Key layout
//!
//! ```text
//! count:{key}                 → running hit total
//! visitors:{key}:{YYYY-MM-DD} → fingerprints seen that day (remote TTL 8 days)
//! users:{key}                 → anonymized user identities
//! ```
//!
//! The remote store uses these names directly. The local store keeps the same
//! three pieces of state in one JSON record per key.

pub mod local;
pub mod remote;

pub use local::LocalStore;
pub use remote::RemoteStore;

use crate::error::StoreError;
use crate::model::{DayVisitors, HitOutcome, RemovalOutcome, UserOutcome};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;

/// Which backend implementation is serving a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Remote,
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Remote => "remote",
            BackendKind::Local => "local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent counter state. Implementations never cache across calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterStore: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Connectivity check
    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert `fingerprint` into the `(key, today)` dedup set and bump the
    /// total if it was absent.
    async fn register_hit(
        &self,
        key: &str,
        fingerprint: &str,
        today: NaiveDate,
    ) -> Result<HitOutcome, StoreError>;

    /// Running total, 0 for unknown keys
    async fn total(&self, key: &str) -> Result<u64, StoreError>;

    async fn add_user(&self, key: &str, identity: &str) -> Result<UserOutcome, StoreError>;

    async fn remove_user(&self, key: &str, identity: &str) -> Result<RemovalOutcome, StoreError>;

    async fn user_count(&self, key: &str) -> Result<u64, StoreError>;

    /// Delete total, dedup sets and users for `key`. Idempotent.
    async fn reset(&self, key: &str, today: NaiveDate) -> Result<(), StoreError>;

    async fn day_visitors(
        &self,
        key: &str,
        day: NaiveDate,
        sample_limit: usize,
    ) -> Result<DayVisitors, StoreError>;
}

pub(crate) fn count_key(key: &str) -> String {
    format!("count:{}", key)
}

pub(crate) fn visitors_key(key: &str, day: &str) -> String {
    format!("visitors:{}:{}", key, day)
}

pub(crate) fn users_key(key: &str) -> String {
    format!("users:{}", key)
}
