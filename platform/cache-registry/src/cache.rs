//! In-memory implementation of the ProjectionCache trait for testing and development

use crate::{CacheResult, ProjectionCache};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

/// ProjectionCache implementation backed by a concurrent in-process map
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Single-process deployments where the cache lives next to the dispatcher
///
/// Values are stored as JSON documents, matching what query handlers would
/// put in an external cache.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<String, Value>,
}

impl InMemoryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Store a value under a key, replacing any previous value
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Fetch a value by key
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ProjectionCache for InMemoryCache {
    async fn evict(&self, key: &str) -> CacheResult<()> {
        // Evicting an absent key is a success by contract
        self.entries.remove(key);
        Ok(())
    }

    async fn contains(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_evict_roundtrip() {
        let cache = InMemoryCache::new();
        cache.insert("AssetsAllJustTen", json!([{"id": "123"}]));
        assert!(cache.contains("AssetsAllJustTen").await.unwrap());

        cache.evict("AssetsAllJustTen").await.unwrap();
        assert!(!cache.contains("AssetsAllJustTen").await.unwrap());
        assert!(cache.get("AssetsAllJustTen").is_none());
    }

    #[tokio::test]
    async fn test_evict_absent_key_is_noop() {
        let cache = InMemoryCache::new();
        cache.evict("never-registered").await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_insert_replaces_value() {
        let cache = InMemoryCache::new();
        cache.insert("AssetByIdJustOne-123", json!({"name": "old"}));
        cache.insert("AssetByIdJustOne-123", json!({"name": "new"}));
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get("AssetByIdJustOne-123").unwrap()["name"],
            json!("new")
        );
    }
}
