//! Process-local storage tier

use crate::cache::entry::CacheEntry;
use crate::cache::types::{BackendKind, StorageStats};
use crate::error::Result;
use crate::storage::{EntryFilter, StorageBackend};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// HashMap behind an async lock. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    fn kind(&self) -> BackendKind {
        BackendKind::InMemory
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        self.entries.write().await.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete_by_key(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn delete_where(&self, filter: &EntryFilter) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !filter.matches_entry(entry));
        let removed = before - entries.len();

        debug!("Memory store removed {} entries", removed);
        Ok(removed)
    }

    async fn clear(&self) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let count = entries.len();
        entries.clear();
        Ok(count)
    }

    async fn stats(&self) -> Result<StorageStats> {
        let entries = self.entries.read().await;
        let mut stats = StorageStats::default();
        for entry in entries.values() {
            stats.record(entry.timestamp, entry.calculate_size() as u64);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::context::ContextTuple;
    use serde_json::json;

    fn entry(key: &str, ctx: ContextTuple, ts: i64) -> CacheEntry {
        CacheEntry::new(key.to_string(), json!({"k": key}), ctx, ts)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store
            .put(entry("/a?#", ContextTuple::new(), 1))
            .await
            .unwrap();

        let found = store.get("/a?#").await.unwrap().unwrap();
        assert_eq!(found.data, json!({"k": "/a?#"}));

        assert!(store.delete_by_key("/a?#").await.unwrap());
        assert!(!store.delete_by_key("/a?#").await.unwrap());
        assert!(store.get("/a?#").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_is_last_write_wins() {
        let store = MemoryStore::new();
        store.put(entry("/a?#", ContextTuple::new(), 1)).await.unwrap();
        let mut newer = entry("/a?#", ContextTuple::new(), 2);
        newer.data = json!("second");
        store.put(newer).await.unwrap();

        assert_eq!(store.get("/a?#").await.unwrap().unwrap().data, json!("second"));
        assert_eq!(store.stats().await.unwrap().entry_count, 1);
    }

    #[tokio::test]
    async fn test_delete_where_by_tenant() {
        let store = MemoryStore::new();
        store.put(entry("/s?#tenantId=1", ContextTuple::for_tenant("1"), 1)).await.unwrap();
        store.put(entry("/s?#tenantId=2", ContextTuple::for_tenant("2"), 2)).await.unwrap();
        store.put(entry("/t?#tenantId=1", ContextTuple::for_tenant("1"), 3)).await.unwrap();

        let removed = store
            .delete_where(&EntryFilter::all().with_context(ContextTuple::for_tenant("1")))
            .await
            .unwrap();

        assert_eq!(removed, 2);
        assert!(store.get("/s?#tenantId=2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let store = MemoryStore::new();
        store.put(entry("/a?#", ContextTuple::new(), 10)).await.unwrap();
        store.put(entry("/b?#", ContextTuple::new(), 20)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.oldest_timestamp, Some(10));
        assert_eq!(stats.newest_timestamp, Some(20));
        assert!(stats.approximate_bytes > 0);

        assert_eq!(store.clear().await.unwrap(), 2);
        assert_eq!(store.stats().await.unwrap(), StorageStats::default());
    }
}
