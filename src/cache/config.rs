//! Configuration for the cache system

use crate::cache::invalidation::InvalidationRules;
use crate::cache::key::normalize_endpoint;
use crate::cache::types::BackendKind;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TTL override for every endpoint under `prefix`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlRule {
    pub prefix: String,
    pub ttl: Duration,
}

impl TtlRule {
    pub fn new(prefix: &str, ttl: Duration) -> Self {
        Self {
            prefix: normalize_endpoint(prefix),
            ttl,
        }
    }
}

const MINUTE: u64 = 60;

/// Endpoint TTLs used when the caller does not pass one.
///
/// Lecture and attendance lists change during the school day; subject
/// catalogs change a few times per term.
pub fn default_ttl_table() -> Vec<TtlRule> {
    vec![
        TtlRule::new("/attendance", Duration::from_secs(2 * MINUTE)),
        TtlRule::new("/lectures", Duration::from_secs(5 * MINUTE)),
        TtlRule::new("/payment-submissions", Duration::from_secs(5 * MINUTE)),
        TtlRule::new("/payments", Duration::from_secs(10 * MINUTE)),
        TtlRule::new("/enrollments", Duration::from_secs(10 * MINUTE)),
        TtlRule::new("/students", Duration::from_secs(15 * MINUTE)),
        TtlRule::new("/results", Duration::from_secs(30 * MINUTE)),
        TtlRule::new("/exams", Duration::from_secs(30 * MINUTE)),
        TtlRule::new("/institute-classes", Duration::from_secs(60 * MINUTE)),
        TtlRule::new("/institute-class-subjects", Duration::from_secs(60 * MINUTE)),
        TtlRule::new("/institutes", Duration::from_secs(6 * 60 * MINUTE)),
        TtlRule::new("/subjects", Duration::from_secs(24 * 60 * MINUTE)),
    ]
}

/// Configuration for the response cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL when neither the caller nor the TTL table decides
    pub default_ttl: Duration,

    /// Per-endpoint TTLs; the longest matching prefix wins
    pub ttl_table: Vec<TtlRule>,

    /// Root of the persistent stores. `None` leaves only the in-memory tier
    pub storage_dir: Option<PathBuf>,

    /// Tiers to probe, in order
    pub backend_order: Vec<BackendKind>,

    /// Hard byte capacity of the flat store
    pub flat_capacity_bytes: u64,

    /// LMDB map size for the indexed store
    pub indexed_map_size_mb: usize,

    /// Recompute and compare content hashes on read
    pub enable_integrity_check: bool,

    /// Run the background sweeper
    pub enable_auto_cleanup: bool,

    /// Interval between sweeps
    pub cleanup_interval: Duration,

    /// Delay before the first sweep
    pub cleanup_initial_delay: Duration,

    /// Mutation rule table
    pub invalidation_rules: InvalidationRules,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30 * MINUTE),
            ttl_table: default_ttl_table(),
            storage_dir: None,
            backend_order: BackendKind::preference_order(),
            // 5 MB, the usual per-origin budget of a browser key-value store
            flat_capacity_bytes: 5 * 1024 * 1024,
            indexed_map_size_mb: 64,
            enable_integrity_check: true,
            enable_auto_cleanup: true,
            cleanup_interval: Duration::from_secs(10 * MINUTE),
            cleanup_initial_delay: Duration::from_secs(30),
            invalidation_rules: InvalidationRules::default(),
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl.is_zero() {
            return Err(CacheError::Config(
                "default_ttl must be greater than 0".to_string(),
            ));
        }

        if self.backend_order.is_empty() {
            return Err(CacheError::Config(
                "backend_order must name at least one backend".to_string(),
            ));
        }

        if self.flat_capacity_bytes == 0 {
            return Err(CacheError::Config(
                "flat_capacity_bytes must be greater than 0".to_string(),
            ));
        }

        if self.indexed_map_size_mb == 0 {
            return Err(CacheError::Config(
                "indexed_map_size_mb must be greater than 0".to_string(),
            ));
        }

        if self.cleanup_interval.is_zero() {
            return Err(CacheError::Config(
                "cleanup_interval must be greater than 0".to_string(),
            ));
        }

        if let Some(rule) = self.ttl_table.iter().find(|r| r.ttl.is_zero()) {
            return Err(CacheError::Config(format!(
                "ttl for {} must be greater than 0",
                rule.prefix
            )));
        }

        Ok(())
    }

    /// TTL for an endpoint: longest matching table prefix, else the default
    pub fn ttl_for(&self, endpoint: &str) -> Duration {
        let endpoint = normalize_endpoint(endpoint);

        self.ttl_table
            .iter()
            .filter(|rule| covers(&rule.prefix, &endpoint))
            .max_by_key(|rule| rule.prefix.len())
            .map(|rule| rule.ttl)
            .unwrap_or(self.default_ttl)
    }

    /// Build from `EDU_CACHE_*` environment variables, loading `.env` first.
    ///
    /// | variable | meaning |
    /// |---|---|
    /// | `EDU_CACHE_DIR` | storage root (default: platform cache dir) |
    /// | `EDU_CACHE_BACKENDS` | comma-separated probe order |
    /// | `EDU_CACHE_DEFAULT_TTL_SECS` | default TTL |
    /// | `EDU_CACHE_FLAT_CAPACITY_BYTES` | flat store capacity |
    /// | `EDU_CACHE_MAP_SIZE_MB` | LMDB map size |
    /// | `EDU_CACHE_INTEGRITY` | `true`/`false` |
    /// | `EDU_CACHE_AUTO_CLEANUP` | `true`/`false` |
    /// | `EDU_CACHE_CLEANUP_INTERVAL_SECS` | sweep interval |
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = CacheConfig::default();

        config.storage_dir = match std::env::var("EDU_CACHE_DIR") {
            Ok(dir) if !dir.trim().is_empty() => Some(PathBuf::from(dir)),
            _ => dirs::cache_dir().map(|d| d.join("edu-cache")),
        };

        if let Ok(order) = std::env::var("EDU_CACHE_BACKENDS") {
            config.backend_order = order
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.parse::<BackendKind>().map_err(CacheError::Config))
                .collect::<Result<Vec<_>>>()?;
        }

        if let Some(secs) = env_parse::<u64>("EDU_CACHE_DEFAULT_TTL_SECS")? {
            config.default_ttl = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_parse::<u64>("EDU_CACHE_FLAT_CAPACITY_BYTES")? {
            config.flat_capacity_bytes = bytes;
        }
        if let Some(mb) = env_parse::<usize>("EDU_CACHE_MAP_SIZE_MB")? {
            config.indexed_map_size_mb = mb;
        }
        if let Some(enabled) = env_parse::<bool>("EDU_CACHE_INTEGRITY")? {
            config.enable_integrity_check = enabled;
        }
        if let Some(enabled) = env_parse::<bool>("EDU_CACHE_AUTO_CLEANUP")? {
            config.enable_auto_cleanup = enabled;
        }
        if let Some(secs) = env_parse::<u64>("EDU_CACHE_CLEANUP_INTERVAL_SECS")? {
            config.cleanup_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Segment-aware prefix check: `/exams` covers `/exams/3` but not `/examsx`
fn covers(prefix: &str, endpoint: &str) -> bool {
    prefix == "/"
        || endpoint == prefix
        || endpoint
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CacheError::Config(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

/// Builder for cache configuration with validation
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    default_ttl: Option<Duration>,
    ttl_table: Option<Vec<TtlRule>>,
    storage_dir: Option<PathBuf>,
    backend_order: Option<Vec<BackendKind>>,
    flat_capacity_bytes: Option<u64>,
    indexed_map_size_mb: Option<usize>,
    enable_integrity_check: Option<bool>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
    cleanup_initial_delay: Option<Duration>,
    invalidation_rules: Option<InvalidationRules>,
}

impl CacheConfigBuilder {
    /// Set default TTL for cache entries
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Replace the endpoint TTL table
    pub fn ttl_table(mut self, table: Vec<TtlRule>) -> Self {
        self.ttl_table = Some(table);
        self
    }

    /// Add or override one endpoint TTL
    pub fn endpoint_ttl(mut self, prefix: &str, ttl: Duration) -> Self {
        let rule = TtlRule::new(prefix, ttl);
        let table = self.ttl_table.get_or_insert_with(default_ttl_table);
        table.retain(|r| r.prefix != rule.prefix);
        table.push(rule);
        self
    }

    pub fn storage_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.storage_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn backend_order(mut self, order: Vec<BackendKind>) -> Self {
        self.backend_order = Some(order);
        self
    }

    pub fn flat_capacity_bytes(mut self, bytes: u64) -> Self {
        self.flat_capacity_bytes = Some(bytes);
        self
    }

    pub fn indexed_map_size_mb(mut self, mb: usize) -> Self {
        self.indexed_map_size_mb = Some(mb);
        self
    }

    pub fn enable_integrity_check(mut self, enable: bool) -> Self {
        self.enable_integrity_check = Some(enable);
        self
    }

    /// Enable or disable automatic cleanup
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    pub fn cleanup_initial_delay(mut self, delay: Duration) -> Self {
        self.cleanup_initial_delay = Some(delay);
        self
    }

    pub fn invalidation_rules(mut self, rules: InvalidationRules) -> Self {
        self.invalidation_rules = Some(rules);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            ttl_table: self.ttl_table.unwrap_or(defaults.ttl_table),
            storage_dir: self.storage_dir.or(defaults.storage_dir),
            backend_order: self.backend_order.unwrap_or(defaults.backend_order),
            flat_capacity_bytes: self
                .flat_capacity_bytes
                .unwrap_or(defaults.flat_capacity_bytes),
            indexed_map_size_mb: self
                .indexed_map_size_mb
                .unwrap_or(defaults.indexed_map_size_mb),
            enable_integrity_check: self
                .enable_integrity_check
                .unwrap_or(defaults.enable_integrity_check),
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
            cleanup_initial_delay: self
                .cleanup_initial_delay
                .unwrap_or(defaults.cleanup_initial_delay),
            invalidation_rules: self
                .invalidation_rules
                .unwrap_or(defaults.invalidation_rules),
        }
    }
}

/// Preset configurations for common use cases
impl CacheConfig {
    /// Process-local cache only, no sweeper
    pub fn in_memory() -> Self {
        Self {
            storage_dir: None,
            backend_order: vec![BackendKind::InMemory],
            enable_auto_cleanup: false,
            ..Default::default()
        }
    }

    /// Persistent tiers rooted at `dir`, falling back to memory
    pub fn persistent(dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: Some(dir.as_ref().to_path_buf()),
            ..Default::default()
        }
    }
}
