//! Hit/miss decision for a looked-up entry

use crate::cache::entry::CacheEntry;
use crate::cache::types::Millis;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Why a lookup did not produce data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissReason {
    /// No entry under the key
    NotFound,

    /// Entry older than the effective TTL
    Expired,

    /// Stored hash does not match the payload
    IntegrityFailed,

    /// Caller asked for fresh data
    ForcedRefresh,
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissReason::NotFound => write!(f, "not found"),
            MissReason::Expired => write!(f, "TTL expired"),
            MissReason::IntegrityFailed => write!(f, "integrity check failed"),
            MissReason::ForcedRefresh => write!(f, "forced refresh"),
        }
    }
}

/// Outcome of validating a lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Hit(Value),
    Miss(MissReason),
}

impl Validation {
    pub fn is_hit(&self) -> bool {
        matches!(self, Validation::Hit(_))
    }

    /// Whether the stored entry should be removed as a consequence
    pub fn should_evict(&self) -> bool {
        matches!(
            self,
            Validation::Miss(MissReason::Expired) | Validation::Miss(MissReason::IntegrityFailed)
        )
    }
}

/// Checks TTL and integrity
#[derive(Debug, Clone, Copy)]
pub struct EntryValidator {
    check_integrity: bool,
}

impl Default for EntryValidator {
    fn default() -> Self {
        Self {
            check_integrity: true,
        }
    }
}

impl EntryValidator {
    pub fn new(check_integrity: bool) -> Self {
        Self { check_integrity }
    }

    /// Decide hit or miss. Expiry is checked before integrity.
    pub fn validate(&self, entry: Option<CacheEntry>, ttl: Duration, now: Millis) -> Validation {
        let Some(entry) = entry else {
            return Validation::Miss(MissReason::NotFound);
        };

        if entry.is_expired(ttl, now) {
            return Validation::Miss(MissReason::Expired);
        }

        if self.check_integrity && entry.verify_integrity() == Some(false) {
            return Validation::Miss(MissReason::IntegrityFailed);
        }

        Validation::Hit(entry.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::context::ContextTuple;
    use serde_json::json;

    const FIFTEEN_MIN: Duration = Duration::from_secs(15 * 60);

    fn entry(timestamp: Millis) -> CacheEntry {
        CacheEntry::new(
            "/lectures?#".to_string(),
            json!([{"id": 1}]),
            ContextTuple::new(),
            timestamp,
        )
        .with_integrity()
    }

    #[test]
    fn test_hit_within_ttl() {
        let v = EntryValidator::default();
        let outcome = v.validate(Some(entry(0)), FIFTEEN_MIN, 60_000);
        assert_eq!(outcome, Validation::Hit(json!([{"id": 1}])));
        assert!(outcome.is_hit());
    }

    #[test]
    fn test_not_found() {
        let v = EntryValidator::default();
        assert_eq!(
            v.validate(None, FIFTEEN_MIN, 0),
            Validation::Miss(MissReason::NotFound)
        );
    }

    #[test]
    fn test_expired_one_minute_past_ttl() {
        let v = EntryValidator::default();
        let now = 100 * 60_000;
        let written = now - 16 * 60_000;
        let outcome = v.validate(Some(entry(written)), FIFTEEN_MIN, now);
        assert_eq!(outcome, Validation::Miss(MissReason::Expired));
        assert!(outcome.should_evict());
    }

    #[test]
    fn test_integrity_failure() {
        let mut corrupted = entry(0);
        corrupted.integrity_hash = Some("deadbeef".to_string());

        let outcome = EntryValidator::default().validate(Some(corrupted.clone()), FIFTEEN_MIN, 1);
        assert_eq!(outcome, Validation::Miss(MissReason::IntegrityFailed));
        assert!(outcome.should_evict());

        // Disabled check lets the payload through
        let outcome = EntryValidator::new(false).validate(Some(corrupted), FIFTEEN_MIN, 1);
        assert!(outcome.is_hit());
    }

    #[test]
    fn test_entry_without_hash_is_trusted() {
        let mut plain = entry(0);
        plain.integrity_hash = None;
        assert!(EntryValidator::default()
            .validate(Some(plain), FIFTEEN_MIN, 1)
            .is_hit());
    }

    #[test]
    fn test_miss_reason_display() {
        assert_eq!(MissReason::Expired.to_string(), "TTL expired");
        assert_eq!(MissReason::ForcedRefresh.to_string(), "forced refresh");
        assert!(!Validation::Miss(MissReason::NotFound).should_evict());
    }
}
