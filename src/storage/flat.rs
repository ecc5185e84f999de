//! Flat persistent key-value tier
//!
//! Layout: `{dir}/{sha256(key)}.json`, one serialized [`CacheEntry`] per
//! file. Writes go to a temporary file first and are renamed into place, so
//! a reader never sees a half-written entry.
//!
//! The store has a hard byte capacity. A write that would overflow it evicts
//! the oldest quarter of the entries and is retried once; if it still does
//! not fit the write fails with [`CacheError::QuotaExceeded`].

use crate::cache::context::ContextTuple;
use crate::cache::entry::CacheEntry;
use crate::cache::types::{BackendKind, Millis, StorageStats};
use crate::error::{CacheError, Result};
use crate::storage::{oldest_quarter, storage_id, EntryFilter, StorageBackend};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EXTENSION: &str = "json";

/// What the store remembers about each file without reading it
#[derive(Debug, Clone)]
struct ManifestRecord {
    key: String,
    context: ContextTuple,
    timestamp: Millis,
    size: u64,
}

pub struct FlatStore {
    dir: PathBuf,
    capacity: u64,
    /// storage id -> record; the lock also serializes writers
    manifest: Mutex<HashMap<String, ManifestRecord>>,
}

impl FlatStore {
    /// Open (creating if needed) the store at `dir`.
    ///
    /// Fails when the directory cannot be created or written to. Existing
    /// files are indexed; unreadable ones are removed.
    pub fn open(dir: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let unavailable = |reason: String| CacheError::BackendUnavailable {
            backend: BackendKind::FlatKv.to_string(),
            reason,
        };

        std::fs::create_dir_all(&dir)
            .map_err(|e| unavailable(format!("{}: {}", dir.display(), e)))?;

        let probe = dir.join(format!(".probe-{}", Uuid::new_v4()));
        std::fs::write(&probe, b"ok")
            .and_then(|_| std::fs::remove_file(&probe))
            .map_err(|e| unavailable(format!("{} is not writable: {}", dir.display(), e)))?;

        let manifest = Self::scan(&dir)?;
        info!(
            "Opened flat cache store at {} ({} entries)",
            dir.display(),
            manifest.len()
        );

        Ok(Self {
            dir,
            capacity,
            manifest: Mutex::new(manifest),
        })
    }

    fn scan(dir: &Path) -> Result<HashMap<String, ManifestRecord>> {
        let mut manifest = HashMap::new();

        for item in std::fs::read_dir(dir)? {
            let path = item?.path();
            let Some(id) = entry_id(&path) else {
                // Leftover temporary files from an interrupted write
                if path.extension().is_some_and(|e| e == "tmp") {
                    let _ = std::fs::remove_file(&path);
                }
                continue;
            };

            let parsed = std::fs::read(&path)
                .map_err(CacheError::from)
                .and_then(|bytes| {
                    let entry: CacheEntry = serde_json::from_slice(&bytes)?;
                    Ok((entry, bytes.len() as u64))
                });

            match parsed {
                Ok((entry, size)) => {
                    manifest.insert(
                        id,
                        ManifestRecord {
                            key: entry.key,
                            context: entry.context,
                            timestamp: entry.timestamp,
                            size,
                        },
                    );
                }
                Err(e) => {
                    warn!("Dropping unreadable cache file {}: {}", path.display(), e);
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        Ok(manifest)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, EXTENSION))
    }

    async fn remove_file(&self, id: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the given ids from disk and manifest
    async fn remove_ids(
        &self,
        manifest: &mut HashMap<String, ManifestRecord>,
        ids: &[String],
    ) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            self.remove_file(id).await?;
            if manifest.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn evict_oldest(&self, manifest: &mut HashMap<String, ManifestRecord>) -> Result<usize> {
        let candidates = manifest
            .iter()
            .map(|(id, record)| (id.clone(), record.timestamp))
            .collect();
        let victims = oldest_quarter(candidates);
        let removed = self.remove_ids(manifest, &victims).await?;

        info!("Flat cache store full, evicted {} oldest entries", removed);
        Ok(removed)
    }

    async fn write_atomic(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;

        if let Err(e) = tokio::fs::rename(&tmp, self.path_for(id)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Storage id of a `<id>.json` path
fn entry_id(path: &Path) -> Option<String> {
    if path.extension()? != EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    (stem.len() == 64 && stem.bytes().all(|b| b.is_ascii_hexdigit())).then(|| stem.to_string())
}

fn used_bytes(manifest: &HashMap<String, ManifestRecord>, except: &str) -> u64 {
    manifest
        .iter()
        .filter(|(id, _)| id.as_str() != except)
        .map(|(_, record)| record.size)
        .sum()
}

#[async_trait]
impl StorageBackend for FlatStore {
    fn kind(&self) -> BackendKind {
        BackendKind::FlatKv
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let id = storage_id(&entry.key);
        let bytes = serde_json::to_vec(&entry)?;
        let needed = bytes.len() as u64;

        let mut manifest = self.manifest.lock().await;

        if used_bytes(&manifest, &id) + needed > self.capacity {
            self.evict_oldest(&mut manifest).await?;

            if used_bytes(&manifest, &id) + needed > self.capacity {
                warn!(
                    "Dropping cache write for {}: {} bytes do not fit in {}",
                    entry.key, needed, self.capacity
                );
                return Err(CacheError::QuotaExceeded {
                    needed,
                    capacity: self.capacity,
                });
            }
        }

        self.write_atomic(&id, &bytes).await?;
        manifest.insert(
            id,
            ManifestRecord {
                key: entry.key,
                context: entry.context,
                timestamp: entry.timestamp,
                size: needed,
            },
        );

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.path_for(&storage_id(key));

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: CacheEntry = serde_json::from_slice(&bytes)?;
        if entry.key != key {
            debug!("Flat store id collision for {}", key);
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn delete_by_key(&self, key: &str) -> Result<bool> {
        let id = storage_id(key);
        let mut manifest = self.manifest.lock().await;
        manifest.remove(&id);
        self.remove_file(&id).await
    }

    async fn delete_where(&self, filter: &EntryFilter) -> Result<usize> {
        let mut manifest = self.manifest.lock().await;

        let ids: Vec<String> = manifest
            .iter()
            .filter(|(_, r)| filter.matches(&r.key, &r.context, r.timestamp))
            .map(|(id, _)| id.clone())
            .collect();

        let removed = self.remove_ids(&mut manifest, &ids).await?;
        debug!("Flat store removed {} entries", removed);
        Ok(removed)
    }

    async fn clear(&self) -> Result<usize> {
        let mut manifest = self.manifest.lock().await;
        let ids: Vec<String> = manifest.keys().cloned().collect();
        self.remove_ids(&mut manifest, &ids).await
    }

    async fn stats(&self) -> Result<StorageStats> {
        let manifest = self.manifest.lock().await;
        let mut stats = StorageStats::default();
        for record in manifest.values() {
            stats.record(record.timestamp, record.size);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(key: &str, ts: Millis) -> CacheEntry {
        CacheEntry::new(
            key.to_string(),
            json!({"payload": "x".repeat(100)}),
            ContextTuple::for_tenant("6"),
            ts,
        )
    }

    fn entry_size(key: &str) -> u64 {
        serde_json::to_vec(&entry(key, 0)).unwrap().len() as u64
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FlatStore::open(dir.path(), 1024 * 1024).unwrap();

        tokio_test::assert_ok!(store.put(entry("/subjects?#tenantId=6", 1)).await);
        let found = store.get("/subjects?#tenantId=6").await.unwrap().unwrap();
        assert_eq!(found.timestamp, 1);
        assert_eq!(found.context.tenant_id.as_deref(), Some("6"));

        assert!(store.get("/missing?#").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FlatStore::open(dir.path(), 1024 * 1024).unwrap();
            store.put(entry("/a?#", 1)).await.unwrap();
            store.put(entry("/b?#", 2)).await.unwrap();
        }

        // Junk that the scan must drop
        std::fs::write(dir.path().join(format!("{}.json", "0".repeat(64))), b"{oops").unwrap();
        std::fs::write(dir.path().join(".half-written.tmp"), b"{").unwrap();

        let store = FlatStore::open(dir.path(), 1024 * 1024).unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.oldest_timestamp, Some(1));
        assert!(store.get("/b?#").await.unwrap().is_some());
        assert!(!dir.path().join(".half-written.tmp").exists());
    }

    #[tokio::test]
    async fn test_quota_evicts_oldest_quarter_then_writes() {
        let dir = TempDir::new().unwrap();
        let one = entry_size("/k0?#");
        // Room for exactly four entries
        let store = FlatStore::open(dir.path(), one * 4).unwrap();

        for i in 0..4 {
            store.put(entry(&format!("/k{}?#", i), i)).await.unwrap();
        }
        store.put(entry("/k4?#", 4)).await.unwrap();

        // k0 was the oldest and went; the rest stayed
        assert!(store.get("/k0?#").await.unwrap().is_none());
        for i in 1..5 {
            assert!(store.get(&format!("/k{}?#", i)).await.unwrap().is_some());
        }
        assert_eq!(store.stats().await.unwrap().entry_count, 4);
    }

    #[tokio::test]
    async fn test_oversized_write_fails_with_quota() {
        let dir = TempDir::new().unwrap();
        let store = FlatStore::open(dir.path(), 64).unwrap();

        let err = store.put(entry("/big?#", 1)).await.unwrap_err();
        assert!(err.is_quota());
        assert!(store.get("/big?#").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_where_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = FlatStore::open(dir.path(), 1024 * 1024).unwrap();

        store.put(entry("/students?#tenantId=6", 1)).await.unwrap();
        store.put(entry("/students/2?#tenantId=6", 2)).await.unwrap();
        store.put(entry("/exams?#tenantId=6", 3)).await.unwrap();

        let removed = store
            .delete_where(&EntryFilter::all().with_prefixes(vec!["/students".to_string()]))
            .await
            .unwrap();
        assert_eq!(removed, 2);

        assert!(store.delete_by_key("/exams?#tenantId=6").await.unwrap());
        assert!(!store.delete_by_key("/exams?#tenantId=6").await.unwrap());

        store.put(entry("/a?#", 1)).await.unwrap();
        assert_eq!(store.clear().await.unwrap(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_open_fails_on_file_path() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("flat");
        std::fs::write(&blocker, b"").unwrap();

        assert!(matches!(
            FlatStore::open(&blocker, 1024),
            Err(CacheError::BackendUnavailable { .. })
        ));
    }
}
