//! Keyed one-way transform for authenticated user ids.
//!
//! With a secret configured, raw ids are replaced by `hex(HMAC-SHA256(secret, id))`
//! before they reach any backend. Without a secret the raw id is stored as-is;
//! this is a degraded-privacy mode and is reported as such by [`IdentityAnonymizer::is_private`].

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Derives stable identities from raw user ids
#[derive(Clone)]
pub struct IdentityAnonymizer {
    secret: Option<String>,
}

impl IdentityAnonymizer {
    /// Create an anonymizer. An empty secret counts as no secret.
    pub fn new(secret: Option<String>) -> Self {
        let secret = secret.filter(|s| !s.is_empty());
        if secret.is_none() {
            warn!("No identity secret configured; user ids will be stored unmodified");
        }
        Self { secret }
    }

    /// Whether stored identities are keyed digests rather than raw ids
    pub fn is_private(&self) -> bool {
        self.secret.is_some()
    }

    pub fn anonymize(&self, raw_id: &str) -> String {
        let Some(secret) = &self.secret else {
            return raw_id.to_string();
        };

        // HMAC accepts keys of any length
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC key length is unrestricted"));
        mac.update(raw_id.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for IdentityAnonymizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityAnonymizer")
            .field("private", &self.is_private())
            .finish()
    }
}
