//! File-backed (or in-memory) counter store.
//!
//! All keys live in one JSON document, `counts.json`:
//!
//! ```text
//! {
//!   "<key>": {
//!     "value": 42,
//!     "days": { "2024-03-01": { "seen": { "<fingerprint>": <epoch ms> } } },
//!     "users": { "<identity>": <epoch ms> }
//!   }
//! }
//! ```
//!
//! Every call re-reads the document under a process-wide mutex, and every
//! mutation is written once through a temp file + rename, so the dedup record,
//! the increment and the pruning of stale days land together or not at all.
//!
//! Concurrency limit: the mutex only serializes writers inside this process.
//! Two processes sharing the same data directory can still interleave their
//! read-modify-write cycles and lose or double-count updates. Deployments that
//! run more than one process should use the remote store.

use super::{BackendKind, CounterStore};
use crate::error::StoreError;
use crate::model::{DayVisitors, HitOutcome, RemovalOutcome, UserOutcome};
use crate::retention::{day_stamp, RetentionPolicy};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// File name of the local document inside the data directory
pub const COUNTS_FILE: &str = "counts.json";

/// Persisted state of one counter key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterRecord {
    /// Running hit total
    #[serde(default)]
    pub value: u64,
    /// Dedup buckets by `YYYY-MM-DD`
    #[serde(default)]
    pub days: BTreeMap<String, DayBucket>,
    /// Anonymized identities with insertion time (epoch ms)
    #[serde(default)]
    pub users: BTreeMap<String, i64>,
}

/// Fingerprints seen on one day, with insertion time (epoch ms)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DayBucket {
    #[serde(default)]
    pub seen: BTreeMap<String, i64>,
}

type Counts = BTreeMap<String, CounterRecord>;

enum Persistence {
    File(PathBuf),
    Memory(Counts),
}

struct LocalInner {
    state: Mutex<Persistence>,
    retention: RetentionPolicy,
}

/// Local counter store
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<LocalInner>,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Store that keeps everything in process memory
    pub fn in_memory() -> Self {
        Self::with_persistence(Persistence::Memory(Counts::new()), None)
    }

    /// Open `counts.json` in `data_dir`, creating both if needed.
    ///
    /// Falls back to an in-memory store when the directory cannot be prepared
    /// (e.g. a read-only filesystem).
    pub fn open(data_dir: &Path) -> Self {
        match Self::open_file(data_dir) {
            Ok(store) => store,
            Err(e) => {
                warn!(
                    data_dir = %data_dir.display(),
                    error = %e,
                    "Local data directory unusable, keeping counts in memory"
                );
                Self::in_memory()
            }
        }
    }

    /// Open `counts.json` in `data_dir`, failing if it cannot be prepared
    pub fn open_file(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(COUNTS_FILE);
        if !path.exists() {
            fs::write(&path, b"{}")?;
        }
        // Surface permission problems now rather than on the first hit
        fs::OpenOptions::new().append(true).open(&path)?;

        info!(path = %path.display(), "Local counter store opened");

        Ok(Self::with_persistence(
            Persistence::File(path.clone()),
            Some(path),
        ))
    }

    fn with_persistence(persistence: Persistence, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                state: Mutex::new(persistence),
                retention: RetentionPolicy::default(),
            }),
            path,
        }
    }

    /// Backing file, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    /// Run `f` against the store; file I/O goes to the blocking pool
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&LocalInner) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        if !self.is_persistent() {
            return f(&self.inner);
        }

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

impl LocalInner {
    fn read<T>(&self, f: impl FnOnce(&Counts) -> T) -> Result<T, StoreError> {
        let guard = self.state.lock();
        match &*guard {
            Persistence::Memory(counts) => Ok(f(counts)),
            Persistence::File(path) => {
                let counts = load(path)?;
                Ok(f(&counts))
            }
        }
    }

    /// Apply `f` and persist if it reports a change. On a failed write the
    /// file keeps its previous contents.
    fn update<T>(&self, f: impl FnOnce(&mut Counts) -> (T, bool)) -> Result<T, StoreError> {
        let mut guard = self.state.lock();
        match &mut *guard {
            Persistence::Memory(counts) => Ok(f(counts).0),
            Persistence::File(path) => {
                let mut counts = load(path)?;
                let (result, changed) = f(&mut counts);
                if changed {
                    save(path, &counts)?;
                }
                Ok(result)
            }
        }
    }

    fn register_hit(
        &self,
        key: &str,
        fingerprint: &str,
        today: NaiveDate,
    ) -> Result<HitOutcome, StoreError> {
        let day = day_stamp(today);
        let seen_at = Utc::now().timestamp_millis();
        let retention = self.retention;

        self.update(|counts| {
            if let Some(record) = counts.get(key) {
                let seen = record
                    .days
                    .get(&day)
                    .is_some_and(|bucket| bucket.seen.contains_key(fingerprint));
                if seen {
                    let outcome = HitOutcome {
                        added: false,
                        total: record.value,
                    };
                    return (outcome, false);
                }
            }

            let record = counts.entry(key.to_string()).or_default();
            record.value = record.value.saturating_add(1);
            record
                .days
                .entry(day)
                .or_default()
                .seen
                .insert(fingerprint.to_string(), seen_at);

            let pruned = retention.prune(&mut record.days, today);
            if pruned > 0 {
                metrics::counter!("counter.retention.pruned_days").increment(pruned as u64);
            }

            let outcome = HitOutcome {
                added: true,
                total: record.value,
            };
            (outcome, true)
        })
    }

    fn add_user(&self, key: &str, identity: &str) -> Result<UserOutcome, StoreError> {
        let added_at = Utc::now().timestamp_millis();
        self.update(|counts| {
            let record = counts.entry(key.to_string()).or_default();
            if record.users.contains_key(identity) {
                let outcome = UserOutcome {
                    added: false,
                    total: record.users.len() as u64,
                };
                return (outcome, false);
            }
            record.users.insert(identity.to_string(), added_at);
            let outcome = UserOutcome {
                added: true,
                total: record.users.len() as u64,
            };
            (outcome, true)
        })
    }

    fn remove_user(&self, key: &str, identity: &str) -> Result<RemovalOutcome, StoreError> {
        self.update(|counts| {
            let Some(record) = counts.get_mut(key) else {
                return (
                    RemovalOutcome {
                        removed: false,
                        total: 0,
                    },
                    false,
                );
            };
            let removed = record.users.remove(identity).is_some();
            let outcome = RemovalOutcome {
                removed,
                total: record.users.len() as u64,
            };
            (outcome, removed)
        })
    }

    fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.update(|counts| ((), counts.remove(key).is_some()))
    }
}

fn load(path: &Path) -> Result<Counts, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Counts::new()),
        Err(e) => return Err(e.into()),
    };
    if raw.trim().is_empty() {
        return Ok(Counts::new());
    }
    Ok(serde_json::from_str(&raw)?)
}

fn save(path: &Path, counts: &Counts) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(counts)?;

    let mut file = fs::File::create(&tmp)?;
    file.write_all(&body)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;

    debug!(path = %path.display(), bytes = body.len(), "Local counts written");
    Ok(())
}

#[async_trait]
impl CounterStore for LocalStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.run(|inner| inner.read(|_| ())).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn register_hit(
        &self,
        key: &str,
        fingerprint: &str,
        today: NaiveDate,
    ) -> Result<HitOutcome, StoreError> {
        let key = key.to_string();
        let fingerprint = fingerprint.to_string();
        self.run(move |inner| inner.register_hit(&key, &fingerprint, today))
            .await
    }

    async fn total(&self, key: &str) -> Result<u64, StoreError> {
        let key = key.to_string();
        self.run(move |inner| inner.read(|counts| counts.get(&key).map_or(0, |r| r.value)))
            .await
    }

    #[instrument(skip(self, identity), level = "debug")]
    async fn add_user(&self, key: &str, identity: &str) -> Result<UserOutcome, StoreError> {
        let key = key.to_string();
        let identity = identity.to_string();
        self.run(move |inner| inner.add_user(&key, &identity)).await
    }

    #[instrument(skip(self, identity), level = "debug")]
    async fn remove_user(&self, key: &str, identity: &str) -> Result<RemovalOutcome, StoreError> {
        let key = key.to_string();
        let identity = identity.to_string();
        self.run(move |inner| inner.remove_user(&key, &identity))
            .await
    }

    async fn user_count(&self, key: &str) -> Result<u64, StoreError> {
        let key = key.to_string();
        self.run(move |inner| {
            inner.read(|counts| counts.get(&key).map_or(0, |r| r.users.len() as u64))
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn reset(&self, key: &str, _today: NaiveDate) -> Result<(), StoreError> {
        let key = key.to_string();
        self.run(move |inner| inner.reset(&key)).await
    }

    async fn day_visitors(
        &self,
        key: &str,
        day: NaiveDate,
        sample_limit: usize,
    ) -> Result<DayVisitors, StoreError> {
        let key = key.to_string();
        let day = day_stamp(day);
        self.run(move |inner| {
            inner.read(|counts| {
                let seen = counts
                    .get(&key)
                    .and_then(|record| record.days.get(&day))
                    .map(|bucket| &bucket.seen);
                DayVisitors {
                    unique_visitors: seen.map_or(0, |s| s.len() as u64),
                    sample: seen
                        .map(|s| s.keys().take(sample_limit).cloned().collect())
                        .unwrap_or_default(),
                    day: day.clone(),
                }
            })
        })
        .await
    }
}
