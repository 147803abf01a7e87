//! Per-key entry metadata.

use std::collections::hash_map::{self, HashMap};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use super::error::ResourceError;
use super::keys::CacheKey;

/// State tracked for every concrete key a resource has seen.
#[derive(Debug, Clone, Default)]
pub struct CacheEntryMetadata {
    pub loading: bool,
    pub outdated: bool,
    pub exception: Option<ResourceError>,
    /// Optional sub-fields fetched together with the entry.
    pub includes: BTreeSet<String>,
    pub loaded_at: Option<Instant>,
}

impl CacheEntryMetadata {
    pub fn has_includes<'a>(&self, includes: impl IntoIterator<Item = &'a str>) -> bool {
        includes
            .into_iter()
            .all(|include| self.includes.contains(include))
    }

    pub(crate) fn mark_loaded(&mut self) {
        self.loading = false;
        self.outdated = false;
        self.exception = None;
        self.loaded_at = Some(Instant::now());
    }

    pub(crate) fn mark_failed(&mut self, error: ResourceError) {
        self.loading = false;
        self.exception = Some(error);
    }
}

type DefaultFactory<K, M> = Arc<dyn Fn(&K) -> M + Send + Sync>;

/// Map that creates values lazily through a default-value factory.
pub struct MetadataMap<K, M> {
    entries: HashMap<K, M>,
    default: DefaultFactory<K, M>,
}

impl<K: CacheKey, M: Default + 'static> MetadataMap<K, M> {
    pub fn new() -> Self {
        Self::with_default(|_| M::default())
    }
}

impl<K: CacheKey, M> MetadataMap<K, M> {
    pub fn with_default<F>(default: F) -> Self
    where
        F: Fn(&K) -> M + Send + Sync + 'static,
    {
        Self {
            entries: HashMap::new(),
            default: Arc::new(default),
        }
    }

    /// Replace the factory used for entries created from now on.
    pub fn set_default<F>(&mut self, default: F)
    where
        F: Fn(&K) -> M + Send + Sync + 'static,
    {
        self.default = Arc::new(default);
    }

    pub fn get(&self, key: &K) -> Option<&M> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut M> {
        self.entries.get_mut(key)
    }

    /// Fetch the entry for `key`, creating it with the factory when missing.
    pub fn get_or_create(&mut self, key: &K) -> &mut M {
        match self.entries.entry(key.clone()) {
            hash_map::Entry::Occupied(entry) => entry.into_mut(),
            hash_map::Entry::Vacant(entry) => {
                let value = (self.default)(key);
                entry.insert(value)
            }
        }
    }

    /// Apply `update` to the entry of every key, creating missing entries.
    pub fn update<'a, I, F>(&mut self, keys: I, mut update: F)
    where
        I: IntoIterator<Item = &'a K>,
        F: FnMut(&mut M),
    {
        for key in keys {
            update(self.get_or_create(key));
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<M> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &M)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K: CacheKey, M: Default + 'static> Default for MetadataMap<K, M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_does_not_create() {
        let map: MetadataMap<&'static str, CacheEntryMetadata> = MetadataMap::new();
        assert!(map.get(&"a").is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn factory_receives_key() {
        let mut map = MetadataMap::with_default(|key: &u32| key * 2);
        assert_eq!(*map.get_or_create(&21), 42);

        *map.get_or_create(&21) += 1;
        assert_eq!(map.get(&21), Some(&43));
    }

    #[test]
    fn update_touches_every_key() {
        let mut map: MetadataMap<u32, CacheEntryMetadata> = MetadataMap::new();
        map.update(&[1, 2, 3], |meta| meta.outdated = true);

        assert_eq!(map.len(), 3);
        assert!(map.iter().all(|(_, meta)| meta.outdated));
    }

    #[test]
    fn mark_loaded_clears_flags() {
        let mut meta = CacheEntryMetadata {
            loading: true,
            outdated: true,
            exception: Some(ResourceError::cancelled("users")),
            ..Default::default()
        };
        meta.mark_loaded();

        assert!(!meta.loading);
        assert!(!meta.outdated);
        assert!(meta.exception.is_none());
        assert!(meta.loaded_at.is_some());
    }

    #[test]
    fn includes_check_requires_all() {
        let mut meta = CacheEntryMetadata::default();
        meta.includes.insert("owner".to_string());

        assert!(meta.has_includes(["owner"]));
        assert!(!meta.has_includes(["owner", "tags"]));
        assert!(meta.has_includes(Vec::<&str>::new()));
    }
}
