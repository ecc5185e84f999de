//! # edu-cache
//!
//! Response cache for an education-management dashboard (institutes,
//! classes, subjects, students, teachers, exams, lectures, payments).
//!
//! It sits between data-fetching call sites and the REST transport:
//! de-duplicates reads, expires data by TTL and purges related entries when a
//! mutation succeeds. Storage is one of three tiers, probed once at startup:
//!
//! | tier | backing | survives restart |
//! |---|---|---|
//! | indexed | LMDB with user/institute indexes | yes |
//! | flat | one JSON file per key, fixed capacity | yes |
//! | in-memory | `HashMap` | no |
//!
//! ## Reading through the cache
//!
//! ```no_run
//! use edu_cache::{CacheConfig, CacheManager, CacheOptions, ContextTuple, HttpVerb, QueryParams};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! # async fn fetch_subjects() -> Result<Value, String> { Ok(json!([])) }
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = Arc::new(CacheManager::new(CacheConfig::from_env()?)?);
//!     let _sweeper = edu_cache::start_sweeper(cache.clone());
//!
//!     let params = QueryParams::new().with("page", 1);
//!     let options = CacheOptions::new().context(ContextTuple::for_tenant("6"));
//!
//!     let subjects = cache
//!         .get_or_fetch("/subjects", Some(&params), &options, fetch_subjects)
//!         .await
//!         .map_err(anyhow::Error::msg)?;
//!     println!("{} subjects", subjects.as_array().map_or(0, Vec::len));
//!
//!     // After POST /subjects succeeded on the server
//!     let event = cache
//!         .invalidate_on_mutation(HttpVerb::Post, "/subjects", options.context.as_ref())
//!         .await;
//!     println!("purged {} entries", event.removed);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;
pub mod storage;

// Re-export main types for convenience
pub use cache::{
    generate_key, key_prefix, start_sweeper, BackendKind, CacheConfig, CacheConfigBuilder,
    CacheDiagnostics, CacheEntry, CacheKey, CacheKeyBuilder, CacheManager, CacheOptions,
    CacheStats, Clock, ContextTuple, EntryValidator, HttpVerb, InvalidationEvent,
    InvalidationReason, InvalidationRule, InvalidationRules, ManualClock, MissReason,
    QueryParams, Scalar, StorageStats, SystemClock, TtlRule, Validation,
};
pub use error::{CacheError, Result};
pub use storage::{open_backend, EntryFilter, FlatStore, IndexedStore, MemoryStore, StorageBackend};
