//! Cache entry with creation timestamp, context and integrity hash

use crate::cache::context::ContextTuple;
use crate::cache::types::{CacheKey, Millis};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// A stored response.
///
/// Entries are immutable once written; refreshing a key writes a new entry
/// over the old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// The cache key
    pub key: CacheKey,

    /// The cached payload
    pub data: Value,

    /// Creation time in epoch milliseconds
    pub timestamp: Millis,

    /// Scoping used for isolation and targeted purges
    #[serde(default)]
    pub context: ContextTuple,

    /// Hash of `data`, recomputed on read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_hash: Option<String>,
}

impl CacheEntry {
    /// Create an entry without an integrity hash
    pub fn new(key: CacheKey, data: Value, context: ContextTuple, timestamp: Millis) -> Self {
        Self {
            key,
            data,
            timestamp,
            context: context.normalized(),
            integrity_hash: None,
        }
    }

    /// Attach the hash of the current payload
    pub fn with_integrity(mut self) -> Self {
        self.integrity_hash = Some(content_hash(&self.data));
        self
    }

    /// Age relative to `now`; zero for entries stamped in the future
    pub fn age(&self, now: Millis) -> Duration {
        Duration::from_millis(now.saturating_sub(self.timestamp).max(0) as u64)
    }

    /// Strictly older than `ttl` at `now`
    pub fn is_expired(&self, ttl: Duration, now: Millis) -> bool {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(self.timestamp) > ttl_ms
    }

    /// `None` when no hash was stored, otherwise whether it still matches
    pub fn verify_integrity(&self) -> Option<bool> {
        self.integrity_hash
            .as_ref()
            .map(|stored| *stored == content_hash(&self.data))
    }

    /// Calculate the size of this entry in bytes
    pub fn calculate_size(&self) -> usize {
        // Approximate size: key + serialized payload + fixed overhead
        let data_len = serde_json::to_vec(&self.data).map(|v| v.len()).unwrap_or(0);
        self.key.len()
            + data_len
            + self.integrity_hash.as_ref().map_or(0, String::len)
            + std::mem::size_of::<Millis>()
    }
}

/// Hex SHA-256 of the payload's canonical JSON encoding
pub fn content_hash(data: &Value) -> String {
    let bytes = serde_json::to_vec(data).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry_at(timestamp: Millis) -> CacheEntry {
        CacheEntry::new(
            "/subjects?#".to_string(),
            json!({"id": 42, "name": "Algebra"}),
            ContextTuple::for_tenant("6"),
            timestamp,
        )
    }

    #[test]
    fn test_cache_entry_creation() {
        let entry = entry_at(1_000);
        assert_eq!(entry.key, "/subjects?#");
        assert_eq!(entry.data["name"], "Algebra");
        assert!(entry.integrity_hash.is_none());
        assert_eq!(entry.verify_integrity(), None);
    }

    #[test]
    fn test_entry_expiration_boundary() {
        let ttl = Duration::from_secs(15 * 60);
        let entry = entry_at(0);

        assert!(!entry.is_expired(ttl, 15 * 60_000));
        assert!(entry.is_expired(ttl, 15 * 60_000 + 1));
    }

    #[test]
    fn test_age_clamps_future_timestamps() {
        let entry = entry_at(10_000);
        assert_eq!(entry.age(4_000), Duration::ZERO);
        assert_eq!(entry.age(12_500), Duration::from_millis(2_500));
    }

    #[test]
    fn test_integrity_roundtrip_and_corruption() {
        let mut entry = entry_at(0).with_integrity();
        assert_eq!(entry.verify_integrity(), Some(true));

        entry.data = json!({"id": 42, "name": "Geometry"});
        assert_eq!(entry.verify_integrity(), Some(false));
    }

    #[test]
    fn test_content_hash_is_stable_across_key_order() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[test]
    fn test_calculate_size() {
        let entry = entry_at(0);
        let size = entry.calculate_size();
        assert!(size >= entry.key.len() + r#"{"id":42,"name":"Algebra"}"#.len());
    }

    #[test]
    fn test_serialized_form_uses_camel_case() {
        let entry = entry_at(5).with_integrity();
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("integrityHash").is_some());
        assert_eq!(json["context"]["tenantId"], "6");

        let back: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }
}
