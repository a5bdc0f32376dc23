//! Backend selection, fixed for the process lifetime.

use crate::config::Config;
use crate::store::{BackendKind, CounterStore, LocalStore, RemoteStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// The store serving calls, plus the store used when it fails
#[derive(Clone)]
pub struct ActiveBackend {
    primary: Arc<dyn CounterStore>,
    fallback: Option<Arc<dyn CounterStore>>,
}

impl ActiveBackend {
    /// Remote store with a local fallback for failed calls
    pub fn remote(remote: Arc<dyn CounterStore>, local: Arc<dyn CounterStore>) -> Self {
        Self {
            primary: remote,
            fallback: Some(local),
        }
    }

    /// Local store only
    pub fn local(local: Arc<dyn CounterStore>) -> Self {
        Self {
            primary: local,
            fallback: None,
        }
    }

    /// Select from configuration: remote when URL and token are both set
    pub fn from_config(config: &Config) -> Result<Self> {
        let local: Arc<dyn CounterStore> = if config.local.in_memory {
            Arc::new(LocalStore::in_memory())
        } else {
            Arc::new(LocalStore::open(&config.data_dir()))
        };

        let backend = match config.remote_credentials() {
            Some((url, token)) => {
                let remote = RemoteStore::new(url, token, config.backend_timeout())
                    .context("Failed to build remote store client")?;
                Self::remote(Arc::new(remote), local)
            }
            None => Self::local(local),
        };

        info!(
            backend = %backend.kind(),
            has_fallback = backend.fallback.is_some(),
            "Counter backend selected"
        );

        Ok(backend)
    }

    pub fn kind(&self) -> BackendKind {
        self.primary.kind()
    }

    pub fn is_remote(&self) -> bool {
        self.kind() == BackendKind::Remote
    }

    pub fn primary(&self) -> &Arc<dyn CounterStore> {
        &self.primary
    }

    pub fn fallback(&self) -> Option<&Arc<dyn CounterStore>> {
        self.fallback.as_ref()
    }
}
