//! # Cache Key Registry
//!
//! A platform-level registry of the read-model cache keys that are currently
//! live, plus the resolution logic that maps an entity change onto the set of
//! keys that must be evicted.
//!
//! ## Why This Lives in Tier 1
//!
//! Query handlers (which fill caches) and the outbox dispatcher (which evicts
//! them) run in different parts of the system. Placing the registry in
//! `platform/` (Tier 1) allows:
//! - Read paths to register keys without depending on the dispatcher
//! - The dispatcher to resolve affected keys without knowing any query handler
//! - Config-driven swap of the cache backend behind [`ProjectionCache`]
//!
//! ## Key format
//!
//! A cache key is the query name, optionally followed by `-`-joined
//! parameters: `AssetsAllJustTen`, `AssetByIdJustOne-123`,
//! `MerchantAssets-m77`. See [`QueryKey`] for the builder.
//!
//! ## Usage
//!
//! ```rust
//! use cache_registry::{CacheKeyRegistry, QueryKey};
//! use std::collections::BTreeSet;
//!
//! let registry = CacheKeyRegistry::new();
//! registry.register(QueryKey::new("AssetsAllJustTen").build());
//! registry.register(QueryKey::new("AssetByIdJustOne").param("123").build());
//!
//! let ids = BTreeSet::from(["123".to_string()]);
//! let affected = registry.resolve("Asset", &ids);
//! assert_eq!(affected.len(), 2);
//! ```

mod cache;
mod key;
mod registry;

pub use cache::InMemoryCache;
pub use key::QueryKey;
pub use registry::CacheKeyRegistry;

use async_trait::async_trait;
use std::fmt;

/// Errors that can occur when talking to a cache backend
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache operation failed: {0}")]
    OperationFailed(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Abstraction over the projection cache the dispatcher evicts from
///
/// Implementations must treat eviction of an absent key as a success: the
/// registry is allowed to over-approximate, so eviction targets may already
/// be gone.
#[async_trait]
pub trait ProjectionCache: Send + Sync {
    /// Remove a key from the cache
    ///
    /// # Arguments
    /// * `key` - The cache key to evict
    ///
    /// # Returns
    /// * `Ok(())` whether or not the key was present
    /// * `Err(CacheError)` only if the backend could not be reached
    async fn evict(&self, key: &str) -> CacheResult<()>;

    /// Check whether a key is currently cached
    async fn contains(&self, key: &str) -> CacheResult<bool>;
}

impl fmt::Debug for dyn ProjectionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProjectionCache")
    }
}
