//! Counting engine: daily fingerprint deduplication, authenticated user sets
//! and admin reset over the selected backend.
//!
//! Every call goes to the primary store under a per-call timeout. When the
//! primary is the remote store and the call fails or times out, the same call
//! is retried once against the local store; that is the only retry. Nothing is
//! cached between calls.

use crate::anonymizer::IdentityAnonymizer;
use crate::error::{CounterError, StoreError};
use crate::model::{
    validate_user_id, CounterKey, DayVisitors, Fingerprint, HitOutcome, RemovalOutcome,
    ResetOutcome, UserOutcome,
};
use crate::retention::{Clock, SystemClock};
use crate::selector::ActiveBackend;
use crate::store::{BackendKind, CounterStore};
use chrono::NaiveDate;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

/// Default bound on a single backend call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Fingerprints returned by [`VisitorCounter::day_visitors`]
pub const VISITOR_SAMPLE_LIMIT: usize = 50;

/// Unique visit and user counter
pub struct VisitorCounter {
    backend: ActiveBackend,
    anonymizer: IdentityAnonymizer,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl VisitorCounter {
    pub fn new(backend: ActiveBackend, anonymizer: IdentityAnonymizer) -> Self {
        Self {
            backend,
            anonymizer,
            clock: Arc::new(SystemClock),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Replace the clock used to pick the dedup day
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn is_remote(&self) -> bool {
        self.backend.is_remote()
    }

    /// Current dedup day (UTC)
    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Whether user ids are anonymized before storage
    pub fn anonymizes_users(&self) -> bool {
        self.anonymizer.is_private()
    }

    /// Record a visit. Returns `added = true` only the first time
    /// `fingerprint` is seen for `key` on the current UTC day.
    #[instrument(skip(self, fingerprint))]
    pub async fn register_hit(
        &self,
        key: &str,
        fingerprint: &str,
    ) -> Result<HitOutcome, CounterError> {
        let key = CounterKey::parse(key)?;
        let fingerprint = Fingerprint::parse(fingerprint)?;
        let today = self.clock.today();

        let outcome = self
            .with_fallback("register_hit", &key, |store| {
                let key = &key;
                let fingerprint = &fingerprint;
                async move {
                    store
                        .register_hit(key.as_str(), fingerprint.as_str(), today)
                        .await
                }
            })
            .await?;

        if outcome.added {
            metrics::counter!("counter.hits.added").increment(1);
        } else {
            metrics::counter!("counter.hits.duplicate").increment(1);
        }

        Ok(outcome)
    }

    /// Current hit total, 0 for unseen keys
    pub async fn get_total(&self, key: &str) -> Result<u64, CounterError> {
        let key = CounterKey::parse(key)?;
        self.with_fallback("get_total", &key, |store| {
            let key = &key;
            async move { store.total(key.as_str()).await }
        })
        .await
    }

    /// Add an authenticated user; `total` is the user set size
    #[instrument(skip(self, raw_id))]
    pub async fn add_user(&self, key: &str, raw_id: &str) -> Result<UserOutcome, CounterError> {
        let key = CounterKey::parse(key)?;
        validate_user_id(raw_id)?;
        let identity = self.anonymizer.anonymize(raw_id);

        let outcome = self
            .with_fallback("add_user", &key, |store| {
                let key = &key;
                let identity = &identity;
                async move { store.add_user(key.as_str(), identity).await }
            })
            .await?;

        if outcome.added {
            metrics::counter!("counter.users.added").increment(1);
        }
        Ok(outcome)
    }

    #[instrument(skip(self, raw_id))]
    pub async fn remove_user(
        &self,
        key: &str,
        raw_id: &str,
    ) -> Result<RemovalOutcome, CounterError> {
        let key = CounterKey::parse(key)?;
        validate_user_id(raw_id)?;
        let identity = self.anonymizer.anonymize(raw_id);

        let outcome = self
            .with_fallback("remove_user", &key, |store| {
                let key = &key;
                let identity = &identity;
                async move { store.remove_user(key.as_str(), identity).await }
            })
            .await?;

        if outcome.removed {
            metrics::counter!("counter.users.removed").increment(1);
        }
        Ok(outcome)
    }

    pub async fn get_user_count(&self, key: &str) -> Result<u64, CounterError> {
        let key = CounterKey::parse(key)?;
        self.with_fallback("get_user_count", &key, |store| {
            let key = &key;
            async move { store.user_count(key.as_str()).await }
        })
        .await
    }

    /// Clear total, dedup days and users for `key`
    #[instrument(skip(self))]
    pub async fn reset(&self, key: &str) -> Result<ResetOutcome, CounterError> {
        let key = CounterKey::parse(key)?;
        let today = self.clock.today();

        self.with_fallback("reset", &key, |store| {
            let key = &key;
            async move { store.reset(key.as_str(), today).await }
        })
        .await?;

        metrics::counter!("counter.resets").increment(1);
        info!(key = %key, "Counter reset");

        Ok(ResetOutcome { reset: true })
    }

    /// Today's dedup set size and a bounded sample of fingerprints
    pub async fn day_visitors(&self, key: &str) -> Result<DayVisitors, CounterError> {
        let key = CounterKey::parse(key)?;
        let today = self.clock.today();

        self.with_fallback("day_visitors", &key, |store| {
            let key = &key;
            async move {
                store
                    .day_visitors(key.as_str(), today, VISITOR_SAMPLE_LIMIT)
                    .await
            }
        })
        .await
    }

    /// Check the primary backend
    pub async fn ping(&self) -> Result<(), CounterError> {
        let operation = "ping";
        match timeout(self.call_timeout, self.backend.primary().ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CounterError::BackendUnavailable {
                operation,
                reason: e.to_string(),
            }),
            Err(_) => Err(CounterError::BackendTimeout {
                operation,
                after: self.call_timeout,
            }),
        }
    }

    /// Try the primary store, then the fallback store once
    async fn with_fallback<'a, T, F, Fut>(
        &'a self,
        operation: &'static str,
        key: &CounterKey,
        call: F,
    ) -> Result<T, CounterError>
    where
        F: Fn(&'a Arc<dyn CounterStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let primary = self.backend.primary();
        let primary_failure = match timeout(self.call_timeout, call(primary)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => CounterError::BackendUnavailable {
                operation,
                reason: e.to_string(),
            },
            Err(_) => CounterError::BackendTimeout {
                operation,
                after: self.call_timeout,
            },
        };

        let Some(fallback) = self.backend.fallback() else {
            metrics::counter!("counter.backend.failures", "operation" => operation).increment(1);
            error!(key = %key, operation, error = %primary_failure, "Backend call failed");
            return Err(primary_failure);
        };

        warn!(
            key = %key,
            operation,
            backend = %primary.kind(),
            error = %primary_failure,
            "Backend call failed, retrying on {} store",
            fallback.kind()
        );
        metrics::counter!("counter.backend.fallbacks", "operation" => operation).increment(1);

        let fallback_failure = match timeout(self.call_timeout, call(fallback)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.call_timeout),
        };

        metrics::counter!("counter.backend.failures", "operation" => operation).increment(1);
        error!(
            key = %key,
            operation,
            primary_error = %primary_failure,
            fallback_error = %fallback_failure,
            "Backend call failed on both stores"
        );

        Err(CounterError::BackendUnavailable {
            operation,
            reason: format!("{}; fallback: {}", primary_failure, fallback_failure),
        })
    }
}
