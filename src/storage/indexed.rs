//! LMDB-backed storage tier with secondary indexes.
//!
//! Uses the heed crate (Rust bindings for LMDB). The environment holds three
//! named databases:
//!
//! | database | key | value |
//! |---|---|---|
//! | `entries` | storage id (hex sha256 of the cache key) | JSON [`CacheEntry`] |
//! | `by_user` | `{user_id}\x1f{storage id}` | unit |
//! | `by_tenant` | `{tenant_id}\x1f{storage id}` | unit |
//!
//! Cache keys can exceed LMDB's key size limit, so records are stored under
//! a fixed-length id and carry their full key in the value. The index
//! databases are created when the environment is opened; purges that pin a
//! user or institute walk the index instead of the whole store.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions: reads use read transactions, every
//! mutation (entry plus index rows) commits in a single write transaction.

use crate::cache::entry::CacheEntry;
use crate::cache::types::{BackendKind, Millis, StorageStats};
use crate::error::{CacheError, Result};
use crate::storage::{oldest_quarter, storage_id, EntryFilter, StorageBackend};
use async_trait::async_trait;
use heed::types::{Bytes, Str, Unit};
use heed::{Database, Env, EnvOpenOptions, MdbError, RwTxn};
use std::path::Path;
use tracing::{debug, info, warn};

const INDEX_SEPARATOR: char = '\x1f';

pub struct IndexedStore {
    env: Env,
    entries: Database<Str, Bytes>,
    by_user: Database<Str, Unit>,
    by_tenant: Database<Str, Unit>,
    map_size: usize,
}

fn index_key(value: &str, id: &str) -> String {
    format!("{}{}{}", value, INDEX_SEPARATOR, id)
}

fn index_prefix(value: &str) -> String {
    format!("{}{}", value, INDEX_SEPARATOR)
}

fn is_map_full(e: &heed::Error) -> bool {
    matches!(e, heed::Error::Mdb(MdbError::MapFull))
}

impl IndexedStore {
    /// Open (creating if needed) the environment at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::BackendUnavailable`] if the directory cannot be
    /// created or the environment or its databases cannot be opened.
    pub fn open(path: impl AsRef<Path>, map_size_mb: usize) -> Result<Self> {
        let path = path.as_ref();
        let unavailable = |reason: String| CacheError::BackendUnavailable {
            backend: BackendKind::Indexed.to_string(),
            reason,
        };

        std::fs::create_dir_all(path)
            .map_err(|e| unavailable(format!("{}: {}", path.display(), e)))?;

        let map_size = map_size_mb * 1024 * 1024;

        // SAFETY: the environment is opened once per manager and the
        // directory is not shared with foreign LMDB users.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(3)
                .open(path)
        }
        .map_err(|e| unavailable(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(|e| unavailable(e.to_string()))?;
        let entries: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some("entries"))
            .map_err(|e| unavailable(e.to_string()))?;
        let by_user: Database<Str, Unit> = env
            .create_database(&mut wtxn, Some("by_user"))
            .map_err(|e| unavailable(e.to_string()))?;
        let by_tenant: Database<Str, Unit> = env
            .create_database(&mut wtxn, Some("by_tenant"))
            .map_err(|e| unavailable(e.to_string()))?;
        wtxn.commit().map_err(|e| unavailable(e.to_string()))?;

        info!("Opened indexed cache store at {}", path.display());

        Ok(Self {
            env,
            entries,
            by_user,
            by_tenant,
            map_size,
        })
    }

    /// Remove one record and its index rows inside `wtxn`
    fn remove_record(&self, wtxn: &mut RwTxn, id: &str) -> heed::Result<bool> {
        let Some(bytes) = self.entries.get(wtxn, id)? else {
            return Ok(false);
        };

        match serde_json::from_slice::<CacheEntry>(bytes) {
            Ok(entry) => {
                if let Some(user) = entry.context.user_id.as_deref() {
                    self.by_user.delete(wtxn, &index_key(user, id))?;
                }
                if let Some(tenant) = entry.context.tenant_id.as_deref() {
                    self.by_tenant.delete(wtxn, &index_key(tenant, id))?;
                }
            }
            Err(e) => debug!("Removing undecodable record {}: {}", id, e),
        }

        self.entries.delete(wtxn, id)
    }

    fn write_record(&self, id: &str, bytes: &[u8], entry: &CacheEntry) -> heed::Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.remove_record(&mut wtxn, id)?;
        self.entries.put(&mut wtxn, id, bytes)?;
        if let Some(user) = entry.context.user_id.as_deref() {
            self.by_user.put(&mut wtxn, &index_key(user, id), &())?;
        }
        if let Some(tenant) = entry.context.tenant_id.as_deref() {
            self.by_tenant.put(&mut wtxn, &index_key(tenant, id), &())?;
        }
        wtxn.commit()
    }

    /// Ids listed under `value` in an index database
    fn indexed_ids(&self, wtxn: &RwTxn, index: Database<Str, Unit>, value: &str) -> heed::Result<Vec<String>> {
        let prefix = index_prefix(value);
        let mut ids = Vec::new();
        for row in index.prefix_iter(wtxn, &prefix)? {
            let (key, ()) = row?;
            ids.push(key[prefix.len()..].to_string());
        }
        Ok(ids)
    }

    /// Candidate ids for a filter, using an index when the filter pins one
    fn candidate_ids(&self, wtxn: &RwTxn, filter: &EntryFilter) -> heed::Result<Vec<String>> {
        if let Some(user) = filter.context.user_id.as_deref() {
            return self.indexed_ids(wtxn, self.by_user, user);
        }
        if let Some(tenant) = filter.context.tenant_id.as_deref() {
            return self.indexed_ids(wtxn, self.by_tenant, tenant);
        }

        let mut ids = Vec::new();
        for row in self.entries.iter(wtxn)? {
            let (id, _) = row?;
            ids.push(id.to_string());
        }
        Ok(ids)
    }

    fn evict_oldest(&self) -> Result<usize> {
        let rtxn = self.env.read_txn()?;
        let mut candidates: Vec<(String, Millis)> = Vec::new();
        for row in self.entries.iter(&rtxn)? {
            let (id, bytes) = row?;
            let timestamp = serde_json::from_slice::<CacheEntry>(bytes)
                .map(|e| e.timestamp)
                .unwrap_or(Millis::MIN);
            candidates.push((id.to_string(), timestamp));
        }
        drop(rtxn);

        let victims = oldest_quarter(candidates);
        let mut wtxn = self.env.write_txn()?;
        let mut removed = 0;
        for id in &victims {
            if self.remove_record(&mut wtxn, id)? {
                removed += 1;
            }
        }
        wtxn.commit()?;

        info!("Indexed cache store full, evicted {} oldest entries", removed);
        Ok(removed)
    }
}

#[async_trait]
impl StorageBackend for IndexedStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Indexed
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let id = storage_id(&entry.key);
        let bytes = serde_json::to_vec(&entry)?;

        match self.write_record(&id, &bytes, &entry) {
            Ok(()) => Ok(()),
            Err(e) if is_map_full(&e) => {
                self.evict_oldest()?;
                self.write_record(&id, &bytes, &entry).map_err(|e| {
                    if is_map_full(&e) {
                        warn!("Dropping cache write for {}: LMDB map is full", entry.key);
                        CacheError::QuotaExceeded {
                            needed: bytes.len() as u64,
                            capacity: self.map_size as u64,
                        }
                    } else {
                        e.into()
                    }
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let rtxn = self.env.read_txn()?;
        let Some(bytes) = self.entries.get(&rtxn, &storage_id(key))? else {
            return Ok(None);
        };

        let entry: CacheEntry = serde_json::from_slice(bytes)?;
        Ok((entry.key == key).then_some(entry))
    }

    async fn delete_by_key(&self, key: &str) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let removed = self.remove_record(&mut wtxn, &storage_id(key))?;
        wtxn.commit()?;
        Ok(removed)
    }

    async fn delete_where(&self, filter: &EntryFilter) -> Result<usize> {
        let mut wtxn = self.env.write_txn()?;
        let candidates = self.candidate_ids(&wtxn, filter)?;

        let mut doomed = Vec::new();
        for id in candidates {
            let Some(bytes) = self.entries.get(&wtxn, &id)? else {
                continue;
            };
            match serde_json::from_slice::<CacheEntry>(bytes) {
                Ok(entry) if filter.matches_entry(&entry) => doomed.push(id),
                Ok(_) => {}
                Err(_) => doomed.push(id),
            }
        }

        let mut removed = 0;
        for id in &doomed {
            if self.remove_record(&mut wtxn, id)? {
                removed += 1;
            }
        }
        wtxn.commit()?;

        debug!("Indexed store removed {} entries", removed);
        Ok(removed)
    }

    async fn clear(&self) -> Result<usize> {
        let mut wtxn = self.env.write_txn()?;
        let count = self.entries.len(&wtxn)? as usize;
        self.entries.clear(&mut wtxn)?;
        self.by_user.clear(&mut wtxn)?;
        self.by_tenant.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(count)
    }

    async fn stats(&self) -> Result<StorageStats> {
        let rtxn = self.env.read_txn()?;
        let mut stats = StorageStats::default();
        for row in self.entries.iter(&rtxn)? {
            let (_, bytes) = row?;
            if let Ok(entry) = serde_json::from_slice::<CacheEntry>(bytes) {
                stats.record(entry.timestamp, bytes.len() as u64);
            }
        }
        Ok(stats)
    }
}
