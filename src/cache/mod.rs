//! # Response Cache
//!
//! Client-side cache for the dashboard's REST reads.
//!
//! ## Features
//!
//! - **Context-Scoped Keys**: user, institute, class, subject and role are part
//!   of every key, so cached data never leaks across users or institutes
//! - **Per-Endpoint TTL**: short for lecture and attendance lists, long for
//!   subject catalogs, overridable per call
//! - **Integrity Checking**: payload hashes are recomputed on read
//! - **Mutation Invalidation**: a rule table maps each write to the endpoint
//!   prefixes it makes stale
//! - **Tiered Storage**: LMDB, flat files or memory, chosen once at startup
//!
//! ## Read path
//!
//! ```text
//! generate_key -> backend.get -> EntryValidator -> Hit(data) | Miss(reason)
//!                                                     |
//!                                     caller fetches, then set_cache
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod entry;
pub mod invalidation;
pub mod key;
pub mod manager;
pub mod types;
pub mod validator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, CacheConfigBuilder, TtlRule};
pub use context::ContextTuple;
pub use entry::CacheEntry;
pub use invalidation::{
    HttpVerb, InvalidationEvent, InvalidationReason, InvalidationRule, InvalidationRules,
};
pub use key::{generate_key, key_prefix, CacheKeyBuilder, QueryParams, Scalar};
pub use manager::{start_sweeper, CacheManager, CacheOptions};
pub use types::{BackendKind, CacheDiagnostics, CacheKey, CacheStats, StorageStats};
pub use validator::{EntryValidator, MissReason, Validation};
