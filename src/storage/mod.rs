//! Storage tiers behind the cache manager
//!
//! Three interchangeable stores share one async interface:
//!
//! - [`IndexedStore`]: LMDB environment with secondary indexes on user and
//!   institute ids, so context purges avoid a full scan
//! - [`FlatStore`]: one JSON document per key in a directory, with a hard
//!   byte capacity
//! - [`MemoryStore`]: a process-local map
//!
//! [`open_backend`] probes them once, in configured order, and returns the
//! first one that opens. Probe failures are logged and skipped; the in-memory
//! store always opens.

pub mod flat;
pub mod indexed;
pub mod memory;

pub use flat::FlatStore;
pub use indexed::IndexedStore;
pub use memory::MemoryStore;

use crate::cache::config::CacheConfig;
use crate::cache::context::ContextTuple;
use crate::cache::entry::CacheEntry;
use crate::cache::types::{BackendKind, Millis, StorageStats};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

/// Uniform interface over the storage tiers.
///
/// Failures are returned, never panicked; the manager decides how to degrade.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Which tier this is
    fn kind(&self) -> BackendKind;

    /// Store an entry, replacing any entry under the same key
    async fn put(&self, entry: CacheEntry) -> Result<()>;

    /// Exact-key lookup
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Remove one entry. Returns whether it existed
    async fn delete_by_key(&self, key: &str) -> Result<bool>;

    /// Remove every entry matching `filter`. Returns the count removed
    async fn delete_where(&self, filter: &EntryFilter) -> Result<usize>;

    /// Remove everything. Returns the count removed
    async fn clear(&self) -> Result<usize>;

    async fn stats(&self) -> Result<StorageStats>;
}

/// Predicate for bulk deletion.
///
/// All parts must hold for an entry to match. An empty prefix list matches
/// every key, an empty context matches every context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryFilter {
    /// Key prefixes, as produced by [`crate::cache::key::key_prefix`]
    pub key_prefixes: Vec<String>,

    /// Context pattern; absent fields are wildcards
    pub context: ContextTuple,

    /// Only entries created strictly before this instant
    pub created_before: Option<Millis>,
}

impl EntryFilter {
    /// Matches every entry
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.key_prefixes = prefixes;
        self
    }

    pub fn with_context(mut self, context: ContextTuple) -> Self {
        self.context = context.normalized();
        self
    }

    pub fn created_before(mut self, cutoff: Millis) -> Self {
        self.created_before = Some(cutoff);
        self
    }

    /// Check the stored parts of an entry against the filter
    pub fn matches(&self, key: &str, context: &ContextTuple, timestamp: Millis) -> bool {
        let prefix_ok = self.key_prefixes.is_empty()
            || self.key_prefixes.iter().any(|p| key.starts_with(p.as_str()));
        let age_ok = self.created_before.map_or(true, |cutoff| timestamp < cutoff);

        prefix_ok && age_ok && self.context.matches(context)
    }

    pub fn matches_entry(&self, entry: &CacheEntry) -> bool {
        self.matches(&entry.key, &entry.context, entry.timestamp)
    }
}

/// Fixed-length, filesystem- and LMDB-safe identifier for a cache key
pub(crate) fn storage_id(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Ids of the oldest quarter of `items` (at least one when non-empty)
pub(crate) fn oldest_quarter(mut items: Vec<(String, Millis)>) -> Vec<String> {
    if items.is_empty() {
        return Vec::new();
    }

    let count = items.len().div_ceil(4);
    items.sort_by_key(|(_, ts)| *ts);
    items.into_iter().take(count).map(|(id, _)| id).collect()
}

/// Open the first tier in `config.backend_order` that works.
///
/// Persistent tiers live under `<storage_dir>/indexed` and
/// `<storage_dir>/flat`; without a storage dir they are skipped. The
/// in-memory store is appended as a last resort if the order omits it.
pub fn open_backend(config: &CacheConfig) -> Arc<dyn StorageBackend> {
    let mut order = config.backend_order.clone();
    if !order.contains(&BackendKind::InMemory) {
        order.push(BackendKind::InMemory);
    }

    for kind in order {
        match try_open(kind, config) {
            Ok(backend) => {
                info!("Cache storage selected: {}", kind);
                return backend;
            }
            Err(e) => warn!("Cache storage {} unavailable, trying next: {}", kind, e),
        }
    }

    Arc::new(MemoryStore::new())
}

fn try_open(kind: BackendKind, config: &CacheConfig) -> Result<Arc<dyn StorageBackend>> {
    let root = || {
        config
            .storage_dir
            .clone()
            .ok_or_else(|| CacheError::BackendUnavailable {
                backend: kind.to_string(),
                reason: "no storage directory configured".to_string(),
            })
    };

    let backend: Arc<dyn StorageBackend> = match kind {
        BackendKind::Indexed => Arc::new(IndexedStore::open(
            root()?.join("indexed"),
            config.indexed_map_size_mb,
        )?),
        BackendKind::FlatKv => Arc::new(FlatStore::open(
            root()?.join("flat"),
            config.flat_capacity_bytes,
        )?),
        BackendKind::InMemory => Arc::new(MemoryStore::new()),
    };

    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_prefix_and_context() {
        let filter = EntryFilter::all()
            .with_prefixes(vec!["/students".to_string()])
            .with_context(ContextTuple::for_tenant("6"));

        let ctx6 = ContextTuple::for_tenant("6").user("1");
        let ctx7 = ContextTuple::for_tenant("7");

        assert!(filter.matches("/students?#tenantId=6", &ctx6, 0));
        assert!(filter.matches("/students/3?#tenantId=6", &ctx6, 0));
        assert!(!filter.matches("/students?#tenantId=7", &ctx7, 0));
        assert!(!filter.matches("/subjects?#tenantId=6", &ctx6, 0));
    }

    #[test]
    fn test_filter_cutoff_is_strict() {
        let filter = EntryFilter::all().created_before(1_000);
        let ctx = ContextTuple::new();
        assert!(filter.matches("/a?#", &ctx, 999));
        assert!(!filter.matches("/a?#", &ctx, 1_000));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let entry = CacheEntry::new(
            "/exams?#userId=3".to_string(),
            json!(null),
            ContextTuple::for_user("3"),
            5,
        );
        assert!(EntryFilter::all().matches_entry(&entry));
    }

    #[test]
    fn test_storage_id_is_stable_hex() {
        let id = storage_id("/subjects?page=1#");
        assert_eq!(id.len(), 64);
        assert_eq!(id, storage_id("/subjects?page=1#"));
        assert_ne!(id, storage_id("/subjects?page=2#"));
    }

    #[test]
    fn test_oldest_quarter() {
        let items: Vec<(String, Millis)> = (0..8)
            .map(|i| (format!("k{}", i), 100 - i as Millis))
            .collect();
        assert_eq!(oldest_quarter(items), vec!["k7".to_string(), "k6".to_string()]);

        assert_eq!(oldest_quarter(vec![("only".to_string(), 1)]), vec!["only"]);
        assert!(oldest_quarter(Vec::new()).is_empty());
    }

    #[test]
    fn test_probe_without_storage_dir_uses_memory() {
        let config = CacheConfig::default();
        let backend = open_backend(&config);
        assert_eq!(backend.kind(), BackendKind::InMemory);
    }

    #[test]
    fn test_probe_falls_back_past_broken_indexed_dir() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the LMDB directory should be
        std::fs::write(dir.path().join("indexed"), b"not a directory").unwrap();

        let backend = open_backend(&CacheConfig::persistent(dir.path()));
        assert_eq!(backend.kind(), BackendKind::FlatKv);
    }

    #[test]
    fn test_probe_respects_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::builder()
            .storage_dir(dir.path())
            .backend_order(vec![BackendKind::FlatKv, BackendKind::Indexed])
            .build();
        assert_eq!(open_backend(&config).kind(), BackendKind::FlatKv);
    }
}
