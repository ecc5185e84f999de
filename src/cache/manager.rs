//! Cache manager: the read, write and purge paths over the selected backend

use crate::cache::{
    clock::{Clock, SystemClock},
    config::CacheConfig,
    context::ContextTuple,
    entry::CacheEntry,
    invalidation::{HttpVerb, InvalidationEvent, InvalidationReason, InvalidationRules},
    key::{generate_key, key_prefix, QueryParams},
    types::{BackendKind, CacheDiagnostics, CacheStats, StorageStats},
    validator::{EntryValidator, MissReason, Validation},
};
use crate::error::Result;
use crate::storage::{open_backend, EntryFilter, StorageBackend};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Per-call options for reads and writes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheOptions {
    /// Overrides the endpoint TTL table
    pub ttl: Option<Duration>,

    /// Skip the lookup and report a miss
    pub force_refresh: bool,

    /// Scoping for key derivation and stored context
    pub context: Option<ContextTuple>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn ttl_minutes(self, minutes: u64) -> Self {
        self.ttl(Duration::from_secs(minutes.saturating_mul(60)))
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn context(mut self, context: ContextTuple) -> Self {
        self.context = Some(context);
        self
    }
}

/// Response cache shared by every data-fetching call site.
///
/// Caching is advisory: no method surfaces a cache failure. Reads degrade to
/// a miss, writes are dropped, purges report zero; each case is logged.
///
/// # Example
///
/// ```no_run
/// use edu_cache::{CacheConfig, CacheManager, CacheOptions, ContextTuple, QueryParams};
/// use serde_json::json;
///
/// # async fn example() -> anyhow::Result<()> {
/// let cache = CacheManager::new(CacheConfig::in_memory())?;
///
/// let params = QueryParams::new().with("page", 1);
/// let options = CacheOptions::new()
///     .ttl_minutes(15)
///     .context(ContextTuple::for_tenant("6"));
///
/// cache
///     .set_cache("/subjects", &json!({"id": 42, "name": "Algebra"}), Some(&params), &options)
///     .await;
///
/// let hit: Option<serde_json::Value> = cache.get_cache("/subjects", Some(&params), &options).await;
/// assert!(hit.is_some());
/// # Ok(())
/// # }
/// ```
pub struct CacheManager {
    config: CacheConfig,
    backend: Arc<dyn StorageBackend>,
    validator: EntryValidator,
    clock: Arc<dyn Clock>,
    stats: RwLock<CacheStats>,
}

impl CacheManager {
    /// Validate the configuration and probe for a storage backend
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Like [`CacheManager::new`] with an explicit time source
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let backend = open_backend(&config);
        Ok(Self::with_backend(config, backend, clock))
    }

    /// Use an already opened backend; no probing
    pub fn with_backend(
        config: CacheConfig,
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            "Initializing cache manager (backend: {}, default ttl: {:?})",
            backend.kind(),
            config.default_ttl
        );

        Self {
            validator: EntryValidator::new(config.enable_integrity_check),
            config,
            backend,
            clock,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn rules(&self) -> &InvalidationRules {
        &self.config.invalidation_rules
    }

    /// Counters since construction
    pub async fn counters(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    /// Key for a request, as used by every read and write
    pub fn key_for(
        &self,
        endpoint: &str,
        params: Option<&QueryParams>,
        options: &CacheOptions,
    ) -> String {
        generate_key(endpoint, params, options.context.as_ref())
    }

    /// Look up a cached response.
    ///
    /// Returns `None` on a miss, an expired or corrupted entry, a forced
    /// refresh, a payload that does not deserialize into `T`, or a backend
    /// failure. Expired and corrupted entries are deleted.
    pub async fn get_cache<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: Option<&QueryParams>,
        options: &CacheOptions,
    ) -> Option<T> {
        if options.force_refresh {
            debug!("Cache bypassed (forced refresh): {}", endpoint);
            self.stats.write().await.bypassed += 1;
            return None;
        }

        let key = self.key_for(endpoint, params, options);
        let ttl = options
            .ttl
            .unwrap_or_else(|| self.config.ttl_for(endpoint));

        let stored = match self.backend.get(&key).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                self.discard(&key).await;
                self.stats.write().await.misses += 1;
                return None;
            }
        };

        let outcome = self
            .validator
            .validate(stored, ttl, self.clock.now_millis());

        if outcome.should_evict() {
            self.discard(&key).await;
        }

        match outcome {
            Validation::Hit(data) => match serde_json::from_value::<T>(data) {
                Ok(value) => {
                    debug!("Cache hit: {}", key);
                    self.stats.write().await.hits += 1;
                    Some(value)
                }
                Err(e) => {
                    warn!("Cached payload for {} has an unexpected shape: {}", key, e);
                    self.stats.write().await.misses += 1;
                    None
                }
            },
            Validation::Miss(reason) => {
                debug!("Cache miss ({}): {}", reason, key);
                let mut stats = self.stats.write().await;
                match reason {
                    MissReason::NotFound => stats.misses += 1,
                    MissReason::Expired => stats.expired += 1,
                    MissReason::IntegrityFailed => stats.integrity_failures += 1,
                    MissReason::ForcedRefresh => stats.bypassed += 1,
                }
                None
            }
        }
    }

    /// Store a response. Returns whether the write reached the backend.
    pub async fn set_cache<T: Serialize>(
        &self,
        endpoint: &str,
        data: &T,
        params: Option<&QueryParams>,
        options: &CacheOptions,
    ) -> bool {
        let key = self.key_for(endpoint, params, options);

        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!("Cannot serialize response for {}: {}", key, e);
                self.stats.write().await.write_failures += 1;
                return false;
            }
        };

        let mut entry = CacheEntry::new(
            key.clone(),
            data,
            options.context.clone().unwrap_or_default(),
            self.clock.now_millis(),
        );
        if self.config.enable_integrity_check {
            entry = entry.with_integrity();
        }

        match self.backend.put(entry).await {
            Ok(()) => {
                debug!("Cached response: {}", key);
                self.stats.write().await.writes += 1;
                true
            }
            Err(e) => {
                warn!("Cache write dropped for {}: {}", key, e);
                self.stats.write().await.write_failures += 1;
                false
            }
        }
    }

    /// Return the cached value, or run `fetch`, cache its result and return it.
    ///
    /// Errors from `fetch` propagate unchanged and nothing is cached.
    pub async fn get_or_fetch<T, E, F, Fut>(
        &self,
        endpoint: &str,
        params: Option<&QueryParams>,
        options: &CacheOptions,
        fetch: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(cached) = self.get_cache::<T>(endpoint, params, options).await {
            return Ok(cached);
        }

        let fresh = fetch().await?;
        self.set_cache(endpoint, &fresh, params, options).await;
        Ok(fresh)
    }

    /// Purge everything a successful mutation may have made stale.
    ///
    /// With a context, only entries whose stored context agrees with every
    /// field it sets are removed.
    pub async fn invalidate_on_mutation(
        &self,
        verb: HttpVerb,
        endpoint: &str,
        context: Option<&ContextTuple>,
    ) -> InvalidationEvent {
        let prefixes = self.config.invalidation_rules.affected_prefixes(verb, endpoint);
        let reason = InvalidationReason::Mutation {
            verb,
            endpoint: endpoint.to_string(),
        };
        let event = InvalidationEvent::new(reason, prefixes.clone()).with_context(context.cloned());

        if prefixes.is_empty() {
            return event;
        }

        let filter = EntryFilter::all()
            .with_prefixes(prefixes.iter().map(|p| key_prefix(p)).collect())
            .with_context(context.cloned().unwrap_or_default());

        let removed = self.purge(&filter).await;
        info!(
            "Invalidated {} entries after {} {} (prefixes: {})",
            removed,
            verb,
            endpoint,
            prefixes.join(", ")
        );

        event.with_removed(removed)
    }

    /// Remove every entry cached for `user_id`
    pub async fn clear_user_cache(&self, user_id: &str) -> usize {
        if user_id.trim().is_empty() {
            warn!("Ignoring user purge with a blank user id");
            return 0;
        }

        let removed = self
            .purge(&EntryFilter::all().with_context(ContextTuple::for_user(user_id)))
            .await;
        info!("Cleared {} cache entries for user {}", removed, user_id);
        removed
    }

    /// Remove every entry cached for institute `tenant_id`
    pub async fn clear_tenant_cache(&self, tenant_id: &str) -> usize {
        if tenant_id.trim().is_empty() {
            warn!("Ignoring tenant purge with a blank tenant id");
            return 0;
        }

        let removed = self
            .purge(&EntryFilter::all().with_context(ContextTuple::for_tenant(tenant_id)))
            .await;
        info!("Cleared {} cache entries for tenant {}", removed, tenant_id);
        removed
    }

    pub async fn clear_all_cache(&self) -> usize {
        match self.backend.clear().await {
            Ok(removed) => {
                info!("Cleared {} entries from cache", removed);
                self.stats.write().await.invalidations += removed as u64;
                removed
            }
            Err(e) => {
                warn!("Cache clear failed: {}", e);
                0
            }
        }
    }

    /// Snapshot of the backend contents plus counters
    pub async fn get_cache_stats(&self) -> CacheDiagnostics {
        let storage = self.backend.stats().await.unwrap_or_else(|e| {
            warn!("Cache stats unavailable: {}", e);
            StorageStats::default()
        });

        CacheDiagnostics::new(self.backend.kind(), storage, self.counters().await)
    }

    /// Remove every entry older than the default TTL. Returns the count removed.
    ///
    /// Per-call TTLs are not recorded, so entries written with a longer
    /// override are swept on the default schedule.
    pub async fn sweep_expired(&self) -> usize {
        let ttl_ms = i64::try_from(self.config.default_ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_millis().saturating_sub(ttl_ms);

        match self
            .backend
            .delete_where(&EntryFilter::all().created_before(cutoff))
            .await
        {
            Ok(removed) => {
                if removed > 0 {
                    debug!("Swept {} expired cache entries", removed);
                }
                self.stats.write().await.evictions_ttl += removed as u64;
                removed
            }
            Err(e) => {
                warn!("Cache sweep failed: {}", e);
                0
            }
        }
    }

    async fn purge(&self, filter: &EntryFilter) -> usize {
        match self.backend.delete_where(filter).await {
            Ok(removed) => {
                self.stats.write().await.invalidations += removed as u64;
                removed
            }
            Err(e) => {
                warn!("Cache purge failed: {}", e);
                0
            }
        }
    }

    async fn discard(&self, key: &str) {
        if let Err(e) = self.backend.delete_by_key(key).await {
            warn!("Failed to delete cache entry {}: {}", key, e);
        }
    }
}

/// Background task sweeping expired entries.
///
/// Waits `cleanup_initial_delay`, then sweeps every `cleanup_interval`. One
/// task and skipped missed ticks keep sweeps from overlapping. Abort the
/// returned handle to stop it. Returns `None` when auto cleanup is disabled.
pub fn start_sweeper(manager: Arc<CacheManager>) -> Option<JoinHandle<()>> {
    if !manager.config.enable_auto_cleanup {
        debug!("Auto cleanup disabled, sweeper not started");
        return None;
    }

    let delay = manager.config.cleanup_initial_delay;
    let period = manager.config.cleanup_interval;

    info!(
        "Starting cache sweeper (initial delay: {:?}, interval: {:?})",
        delay, period
    );

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + delay, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            manager.sweep_expired().await;
        }
    }))
}
