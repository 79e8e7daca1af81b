//! Concurrent registry of live cache keys with affected-key resolution

use crate::key;
use dashmap::DashMap;
use std::collections::BTreeSet;

/// Registry of the cache keys currently live in the projection cache
///
/// Read paths register a key whenever they fill the cache; the dispatcher
/// resolves entity changes against the registry and unregisters keys after
/// evicting them. The registry may over-approximate (hold keys the cache has
/// already expired) because evicting an absent key is a no-op. It must never
/// silently under-approximate: a key registered before a change is visible
/// to [`CacheKeyRegistry::resolve`] for that change.
///
/// Backed by a sharded concurrent map, so registration on hot read paths does
/// not serialize behind a global lock.
#[derive(Debug, Default)]
pub struct CacheKeyRegistry {
    keys: DashMap<String, ()>,
}

impl CacheKeyRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }

    /// Record a key as live; registering an existing key is a no-op
    pub fn register(&self, key: impl Into<String>) {
        self.keys.insert(key.into(), ());
    }

    /// Drop a key from the registry
    ///
    /// Returns `true` if the key was present.
    pub fn unregister(&self, key: &str) -> bool {
        self.keys.remove(key).is_some()
    }

    /// Whether a key is currently registered
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Point-in-time snapshot of all registered keys
    ///
    /// Keys registered concurrently with the snapshot may or may not appear.
    pub fn keys(&self) -> Vec<String> {
        self.keys.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Remove every registered key
    pub fn clear(&self) {
        self.keys.clear();
    }

    /// Resolve the registered keys affected by a change to `entity_type`
    ///
    /// A key is affected when either rule matches:
    /// - **kind-wide**: the key has no parameter segments and its query name
    ///   starts with `entity_type` (e.g. `AssetsAllJustTen` for `Asset`)
    /// - **identifier**: any parameter segment equals one of `identifiers`
    ///   (e.g. `MerchantAssets-m77` when `m77` changed)
    ///
    /// The rules are a union, so cross-entity projections keyed by a foreign
    /// identifier are still caught. The result errs on the side of evicting
    /// too much, never too little.
    ///
    /// # Returns
    /// Affected keys in sorted order.
    pub fn resolve(&self, entity_type: &str, identifiers: &BTreeSet<String>) -> Vec<String> {
        let mut affected: Vec<String> = self
            .keys
            .iter()
            .filter(|entry| {
                let key = entry.key();
                let kind_wide =
                    !key::has_params(key) && key::query_name(key).starts_with(entity_type);
                kind_wide || identifiers.iter().any(|id| key::has_identifier(key, id))
            })
            .map(|entry| entry.key().clone())
            .collect();
        affected.sort();
        affected
    }
}
