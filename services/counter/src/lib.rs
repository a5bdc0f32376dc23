//! Visitor Counter
//!
//! Counting engine behind visit and user badges. For a named counter ("key")
//! it decides whether a visit fingerprint is new for the current UTC day,
//! keeps a running total of such visits, tracks a separate set of
//! authenticated users, and retires dedup records after an 8-day window.
//!
//! ## Features
//!
//! - **Daily Deduplication**: one increment per fingerprint per key per day
//! - **Two Backends**: a remote Redis REST store, or a local JSON file / memory
//!   map when no remote credentials are configured
//! - **Per-Call Fallback**: a failed or slow remote call is retried once on the
//!   local store, without switching backends permanently
//! - **Anonymized Users**: user ids are replaced by HMAC digests when a secret
//!   is configured
//!
//! ## Architecture
//!
//! ```text
//!  HTTP API                 VisitorCounter                 Stores
//! ┌──────────────┐  key,   ┌──────────────────┐  primary  ┌──────────────┐
//! │ /api/hit     │  fp     │ validate         │──────────▶│ RemoteStore  │
//! │ /api/count   │────────▶│ anonymize ids    │           └──────────────┘
//! │ /api/admin/* │         │ timeout + retry  │  fallback ┌──────────────┐
//! └──────────────┘         └──────────────────┘──────────▶│ LocalStore   │
//!                                                         │ (prunes days)│
//!                                                         └──────────────┘
//! ```

pub mod anonymizer;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod retention;
pub mod selector;
pub mod store;

pub use anonymizer::IdentityAnonymizer;
pub use api::AppState;
pub use crate::config::Config;
pub use engine::VisitorCounter;
pub use error::{CounterError, StoreError};
pub use fingerprint::VisitFingerprint;
pub use model::{
    CounterKey, DayVisitors, Fingerprint, HitOutcome, RemovalOutcome, ResetOutcome, UserOutcome,
};
pub use retention::{Clock, RetentionPolicy, SystemClock};
pub use selector::ActiveBackend;
pub use store::{BackendKind, CounterStore, LocalStore, RemoteStore};

/// Build the engine described by `config`
pub fn build_counter(config: &Config) -> anyhow::Result<VisitorCounter> {
    let backend = ActiveBackend::from_config(config)?;
    let anonymizer = IdentityAnonymizer::new(config.identity.secret.clone());
    Ok(VisitorCounter::new(backend, anonymizer).with_call_timeout(config.backend_timeout()))
}
