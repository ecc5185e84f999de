//! Core type definitions for the cache system

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cache key type, produced by [`crate::cache::key::generate_key`]
pub type CacheKey = String;

/// Epoch milliseconds
pub type Millis = i64;

/// Which storage tier is serving the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Transactional store with secondary indexes (LMDB)
    Indexed,

    /// Flat persistent key-value store (one document per key)
    FlatKv,

    /// Process-local map, lost on restart
    InMemory,
}

impl BackendKind {
    /// Default probing order, most capable first
    pub fn preference_order() -> Vec<BackendKind> {
        vec![BackendKind::Indexed, BackendKind::FlatKv, BackendKind::InMemory]
    }

    pub fn is_persistent(&self) -> bool {
        !matches!(self, BackendKind::InMemory)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Indexed => write!(f, "indexed"),
            BackendKind::FlatKv => write!(f, "flat_kv"),
            BackendKind::InMemory => write!(f, "in_memory"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "indexed" | "lmdb" => Ok(BackendKind::Indexed),
            "flat_kv" | "flat" | "file" => Ok(BackendKind::FlatKv),
            "in_memory" | "memory" => Ok(BackendKind::InMemory),
            other => Err(format!("unknown backend kind: {}", other)),
        }
    }
}

/// Raw figures reported by a storage backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Number of stored entries
    pub entry_count: usize,

    /// Approximate bytes occupied by stored entries
    pub approximate_bytes: u64,

    /// Creation time of the oldest entry
    pub oldest_timestamp: Option<Millis>,

    /// Creation time of the newest entry
    pub newest_timestamp: Option<Millis>,
}

impl StorageStats {
    /// Fold one entry into the running figures
    pub fn record(&mut self, timestamp: Millis, size: u64) {
        self.entry_count += 1;
        self.approximate_bytes += size;
        self.oldest_timestamp = Some(self.oldest_timestamp.map_or(timestamp, |t| t.min(timestamp)));
        self.newest_timestamp = Some(self.newest_timestamp.map_or(timestamp, |t| t.max(timestamp)));
    }
}

/// Hit/miss counters kept by the manager
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from cache
    pub hits: u64,

    /// Lookups that found nothing
    pub misses: u64,

    /// Lookups that found an expired entry
    pub expired: u64,

    /// Lookups that found a corrupted entry
    pub integrity_failures: u64,

    /// Lookups skipped by `force_refresh`
    pub bypassed: u64,

    /// Successful writes
    pub writes: u64,

    /// Writes dropped after a backend failure
    pub write_failures: u64,

    /// Entries removed by mutation rules and bulk purges
    pub invalidations: u64,

    /// Entries removed by the sweeper
    pub evictions_ttl: u64,
}

impl CacheStats {
    /// Total misses of every kind
    pub fn total_misses(&self) -> u64 {
        self.misses + self.expired + self.integrity_failures + self.bypassed
    }

    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.total_misses();
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, writes: {}, invalidations: {}, evictions: {} }}",
            self.hits,
            self.total_misses(),
            self.hit_rate(),
            self.writes,
            self.invalidations,
            self.evictions_ttl
        )
    }
}

/// Diagnostics snapshot returned by `get_cache_stats`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheDiagnostics {
    pub total_entries: usize,

    /// Approximate bytes
    pub total_size: u64,

    pub storage_type: BackendKind,

    pub oldest_entry: Option<DateTime<Utc>>,

    pub newest_entry: Option<DateTime<Utc>>,

    /// Counters since the manager was created
    pub counters: CacheStats,
}

impl CacheDiagnostics {
    pub fn new(storage_type: BackendKind, storage: StorageStats, counters: CacheStats) -> Self {
        Self {
            total_entries: storage.entry_count,
            total_size: storage.approximate_bytes,
            storage_type,
            oldest_entry: storage.oldest_timestamp.and_then(to_datetime),
            newest_entry: storage.newest_timestamp.and_then(to_datetime),
            counters,
        }
    }
}

fn to_datetime(ms: Millis) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

impl fmt::Display for CacheDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_ts = |ts: &Option<DateTime<Utc>>| {
            ts.map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        };

        writeln!(f, "storage:  {}", self.storage_type)?;
        writeln!(f, "entries:  {}", self.total_entries)?;
        writeln!(f, "size:     {} bytes", self.total_size)?;
        writeln!(f, "oldest:   {}", fmt_ts(&self.oldest_entry))?;
        writeln!(f, "newest:   {}", fmt_ts(&self.newest_entry))?;
        write!(f, "{}", self.counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 15,
            expired: 5,
            ..Default::default()
        };

        assert_eq!(stats.hit_rate(), 80.0);
        assert_eq!(stats.miss_rate(), 20.0);
    }

    #[test]
    fn test_cache_stats_zero_requests() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.miss_rate(), 100.0);
    }

    #[test]
    fn test_storage_stats_record() {
        let mut stats = StorageStats::default();
        stats.record(2_000, 10);
        stats.record(1_000, 5);
        stats.record(3_000, 1);

        assert_eq!(stats.entry_count, 3);
        assert_eq!(stats.approximate_bytes, 16);
        assert_eq!(stats.oldest_timestamp, Some(1_000));
        assert_eq!(stats.newest_timestamp, Some(3_000));
    }

    #[test]
    fn test_backend_kind_display_and_parse() {
        assert_eq!(BackendKind::Indexed.to_string(), "indexed");
        assert_eq!(BackendKind::FlatKv.to_string(), "flat_kv");
        assert_eq!(BackendKind::InMemory.to_string(), "in_memory");

        assert_eq!("lmdb".parse::<BackendKind>(), Ok(BackendKind::Indexed));
        assert_eq!("Flat".parse::<BackendKind>(), Ok(BackendKind::FlatKv));
        assert!("redis".parse::<BackendKind>().is_err());

        assert!(BackendKind::FlatKv.is_persistent());
        assert!(!BackendKind::InMemory.is_persistent());
    }

    #[test]
    fn test_diagnostics_from_storage() {
        let storage = StorageStats {
            entry_count: 2,
            approximate_bytes: 512,
            oldest_timestamp: Some(1_700_000_000_000),
            newest_timestamp: None,
        };
        let diag = CacheDiagnostics::new(BackendKind::FlatKv, storage, CacheStats::default());

        assert_eq!(diag.total_entries, 2);
        assert_eq!(diag.storage_type, BackendKind::FlatKv);
        assert_eq!(
            diag.oldest_entry.map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
        assert!(diag.newest_entry.is_none());
        assert!(diag.to_string().contains("flat_kv"));
    }
}
