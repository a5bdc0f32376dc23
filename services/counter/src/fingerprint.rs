//! Visit fingerprint derivation used by the HTTP layer.
//!
//! The engine never interprets fingerprints. This builder only reproduces the
//! digest that callers hand to [`crate::engine::VisitorCounter::register_hit`]:
//! SHA-256 over `key|ip|user_agent|day` with an optional `|client_id` suffix.

use crate::model::Fingerprint;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};

/// Inputs identifying one visitor on one day
#[derive(Debug, Clone)]
pub struct VisitFingerprint<'a> {
    key: &'a str,
    ip: &'a str,
    user_agent: &'a str,
    day: NaiveDate,
    client_id: Option<&'a str>,
}

impl<'a> VisitFingerprint<'a> {
    pub fn new(key: &'a str, day: NaiveDate) -> Self {
        Self {
            key,
            ip: "",
            user_agent: "",
            day,
            client_id: None,
        }
    }

    pub fn ip(mut self, ip: &'a str) -> Self {
        self.ip = ip;
        self
    }

    pub fn user_agent(mut self, user_agent: &'a str) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Client-supplied id; empty strings are ignored
    pub fn client_id(mut self, client_id: Option<&'a str>) -> Self {
        self.client_id = client_id.filter(|c| !c.is_empty());
        self
    }

    /// The string that gets hashed
    pub fn base(&self) -> String {
        let day = self.day.format("%Y-%m-%d");
        match self.client_id {
            Some(cid) => format!(
                "{}|{}|{}|{}|{}",
                self.key, self.ip, self.user_agent, day, cid
            ),
            None => format!("{}|{}|{}|{}", self.key, self.ip, self.user_agent, day),
        }
    }

    pub fn digest(&self) -> Fingerprint {
        Fingerprint::from_sha256(Sha256::digest(self.base().as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[test]
    fn test_base_without_client_id() {
        let fp = VisitFingerprint::new("profile", day())
            .ip("10.0.0.1")
            .user_agent("curl/8.0");
        assert_eq!(fp.base(), "profile|10.0.0.1|curl/8.0|2024-03-01");
    }

    #[test]
    fn test_empty_client_id_is_ignored() {
        let with_empty = VisitFingerprint::new("profile", day()).client_id(Some(""));
        let without = VisitFingerprint::new("profile", day());
        assert_eq!(with_empty.digest(), without.digest());
    }

    #[test]
    fn test_client_id_changes_digest() {
        let a = VisitFingerprint::new("profile", day()).client_id(Some("abc"));
        let b = VisitFingerprint::new("profile", day());
        assert_ne!(a.digest(), b.digest());
        assert!(a.base().ends_with("|abc"));
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        let fp = VisitFingerprint::new("k", day()).digest();
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_next_day_changes_digest() {
        let next = day().succ_opt().unwrap();
        assert_ne!(
            VisitFingerprint::new("k", day()).digest(),
            VisitFingerprint::new("k", next).digest()
        );
    }
}
