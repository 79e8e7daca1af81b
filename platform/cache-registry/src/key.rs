//! Cache key construction and segment helpers

/// Builder for cache keys in the `QueryName[-param…]` format
///
/// The query name identifies the projection (e.g. `AssetsAllJustTen`); each
/// parameter narrows it to concrete entities (e.g. an asset id, a merchant
/// id). Parameters are joined with `-`, so the resolution rules in
/// [`crate::CacheKeyRegistry::resolve`] can tell kind-wide keys (no `-`)
/// from targeted ones.
///
/// # Example
/// ```rust
/// use cache_registry::QueryKey;
///
/// assert_eq!(QueryKey::new("AssetsAllJustTen").build(), "AssetsAllJustTen");
/// assert_eq!(
///     QueryKey::new("MerchantAssets").param("m77").build(),
///     "MerchantAssets-m77"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKey {
    name: String,
    params: Vec<String>,
}

impl QueryKey {
    /// Start a key for the given query name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Append a parameter segment
    pub fn param(mut self, value: impl ToString) -> Self {
        self.params.push(value.to_string());
        self
    }

    /// Render the final key string
    pub fn build(&self) -> String {
        if self.params.is_empty() {
            self.name.clone()
        } else {
            let mut key = self.name.clone();
            for p in &self.params {
                key.push('-');
                key.push_str(p);
            }
            key
        }
    }
}

/// The query-name portion of a key (everything before the first `-`)
pub(crate) fn query_name(key: &str) -> &str {
    key.split('-').next().unwrap_or(key)
}

/// Whether the key carries any parameter segments
pub(crate) fn has_params(key: &str) -> bool {
    key.contains('-')
}

/// Whether `key` carries `id` anchored on segment boundaries
///
/// Identifiers may themselves contain `-` (UUIDs do), so this matches the id
/// as a dash-bounded unit rather than splitting the key. A short id that
/// happens to align with a segment of a longer parameter (a UUID chunk, say)
/// also matches; eviction tolerates that over-approximation, while missing a
/// genuinely affected key would serve stale reads.
pub(crate) fn has_identifier(key: &str, id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    let anchored = format!("-{id}");
    key.ends_with(&anchored) || key.contains(&format!("{anchored}-"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_without_params() {
        assert_eq!(QueryKey::new("AssetsAllJustTen").build(), "AssetsAllJustTen");
    }

    #[test]
    fn test_build_with_params() {
        let key = QueryKey::new("MerchantAssets")
            .param("m77")
            .param(123)
            .build();
        assert_eq!(key, "MerchantAssets-m77-123");
    }

    #[test]
    fn test_query_name_and_params() {
        assert_eq!(query_name("AssetByIdJustOne-123"), "AssetByIdJustOne");
        assert_eq!(query_name("AssetsAllJustTen"), "AssetsAllJustTen");
        assert!(has_params("AssetByIdJustOne-123"));
        assert!(!has_params("AssetsAllJustTen"));
    }

    #[test]
    fn test_has_identifier_simple() {
        assert!(has_identifier("AssetByIdJustOne-123", "123"));
        assert!(has_identifier("MerchantAssets-m77-123", "m77"));
        assert!(!has_identifier("AssetByIdJustOne-123", "23"));
        assert!(!has_identifier("AssetByIdJustOne-123", "999"));
    }

    #[test]
    fn test_has_identifier_uuid_param() {
        // UUID parameters contain dashes; the id must still match as a unit
        let id = "550e8400-e29b-41d4-a716-446655440000";
        let key = format!("AssetByIdJustOne-{id}");
        assert!(has_identifier(&key, id));
        // A dash-bounded chunk of the UUID matches too: evicting a key that
        // was not affected is harmless, skipping one that was is not
        assert!(has_identifier(&key, "e29b"));
        // Fragments not bounded by dashes never match
        assert!(!has_identifier(&key, "8400"));
        assert!(!has_identifier(&key, "550e"));
    }

    #[test]
    fn test_has_identifier_empty_id() {
        assert!(!has_identifier("AssetByIdJustOne-123", ""));
    }
}
