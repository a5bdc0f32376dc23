use crate::error::CounterError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a counter key in bytes
pub const MAX_KEY_LEN: usize = 256;

/// Maximum length of a fingerprint in bytes
pub const MAX_FINGERPRINT_LEN: usize = 128;

/// Maximum length of a raw user id in bytes
pub const MAX_USER_ID_LEN: usize = 256;

/// Validated counter namespace (e.g. a badge name)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey(String);

impl CounterKey {
    pub fn parse(raw: &str) -> Result<Self, CounterError> {
        if raw.trim().is_empty() {
            return Err(CounterError::InvalidKey("key is empty".to_string()));
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(CounterError::InvalidKey(format!(
                "key exceeds {} bytes",
                MAX_KEY_LEN
            )));
        }
        if raw.chars().any(char::is_control) {
            return Err(CounterError::InvalidKey(
                "key contains control characters".to_string(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque per-visit digest. Compared by exact equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn parse(raw: &str) -> Result<Self, CounterError> {
        if raw.is_empty() {
            return Err(CounterError::InvalidFingerprint(
                "fingerprint is empty".to_string(),
            ));
        }
        if raw.len() > MAX_FINGERPRINT_LEN {
            return Err(CounterError::InvalidFingerprint(format!(
                "fingerprint exceeds {} bytes",
                MAX_FINGERPRINT_LEN
            )));
        }
        if !raw.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(CounterError::InvalidFingerprint(
                "fingerprint must be visible ASCII".to_string(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    /// Hex-encode a raw digest
    pub fn from_digest(digest: &[u8]) -> Result<Self, CounterError> {
        Self::parse(&hex::encode(digest))
    }

    /// Hex-encode a SHA-256 digest (64 chars, always within the length bound)
    pub(crate) fn from_sha256(digest: impl AsRef<[u8]>) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate a raw user id before it is anonymized
pub(crate) fn validate_user_id(raw: &str) -> Result<(), CounterError> {
    if raw.trim().is_empty() {
        return Err(CounterError::InvalidUserId("user id is empty".to_string()));
    }
    if raw.len() > MAX_USER_ID_LEN {
        return Err(CounterError::InvalidUserId(format!(
            "user id exceeds {} bytes",
            MAX_USER_ID_LEN
        )));
    }
    Ok(())
}

/// Result of registering a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitOutcome {
    /// Whether the fingerprint was new for today's window
    pub added: bool,
    /// Running total after the call
    pub total: u64,
}

/// Result of adding a user identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserOutcome {
    pub added: bool,
    /// Cardinality of the user set
    pub total: u64,
}

/// Result of removing a user identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalOutcome {
    pub removed: bool,
    pub total: u64,
}

/// Result of an admin reset. Always `reset: true` on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetOutcome {
    pub reset: bool,
}

/// Today's dedup window for a key, for admin diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayVisitors {
    /// Day in `YYYY-MM-DD`
    pub day: String,
    /// Number of distinct fingerprints seen that day
    pub unique_visitors: u64,
    /// Bounded sample of fingerprints
    pub sample: Vec<String>,
}
