//! Keyed cache resource.
//!
//! `CachedResource` owns the store, per-key metadata, consumer tracking and
//! the in-flight load table for one kind of entity. Concurrent requests for a
//! key that is already loading join the running load instead of calling the
//! loader again.

use std::collections::HashMap;
use std::fmt;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::{counter, histogram};
use tokio::task::AbortHandle;
use tracing::{debug, info, instrument, warn};

use crate::executor::HandlerId;
use crate::lock::mutex_lock;

use super::config::ResourceConfig;
use super::error::ResourceError;
use super::events::{LoadFailure, ResourceEvents};
use super::keys::{CacheKey, ResourceAliases, ResourceKey};
use super::loader::ResourceLoader;
use super::metadata::{CacheEntryMetadata, MetadataMap};
use super::use_tracker::{ConsumerId, UseToken, UseTracker};

const SOURCE: &str = "resource::core";

const METRIC_LOAD_TOTAL: &str = "rescore_resource_load_total";
const METRIC_LOAD_JOINED_TOTAL: &str = "rescore_resource_load_joined_total";
const METRIC_LOAD_ERROR_TOTAL: &str = "rescore_resource_load_error_total";
const METRIC_LOAD_MS: &str = "rescore_resource_load_ms";

type SharedLoad = Shared<BoxFuture<'static, Result<(), ResourceError>>>;

/// Identity of one loader invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadId(u64);

impl fmt::Display for LoadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "load-{}", self.0)
    }
}

struct InFlightLoad {
    id: LoadId,
    future: SharedLoad,
    abort: Arc<AbortHandle>,
}

struct ResourceState<K, V> {
    store: HashMap<K, V>,
    metadata: MetadataMap<K, CacheEntryMetadata>,
    uses: UseTracker<K>,
    in_flight: HashMap<K, InFlightLoad>,
}

impl<K: CacheKey, V> ResourceState<K, V> {
    fn new() -> Self {
        Self {
            store: HashMap::new(),
            metadata: MetadataMap::new(),
            uses: UseTracker::new(),
            in_flight: HashMap::new(),
        }
    }

    /// Remove the in-flight entries still owned by load `id` and return their keys.
    ///
    /// Keys deleted or cleared while the load ran are no longer owned and
    /// must not be written back.
    fn take_owned(&mut self, id: LoadId, keys: &[K]) -> Vec<K> {
        let owned: Vec<K> = keys
            .iter()
            .filter(|key| {
                self.in_flight
                    .get(*key)
                    .is_some_and(|in_flight| in_flight.id == id)
            })
            .cloned()
            .collect();
        for key in &owned {
            self.in_flight.remove(key);
        }
        owned
    }

    fn is_known(&self, key: &K) -> bool {
        self.metadata.contains(key) || self.store.contains_key(key)
    }
}

struct ResourceInner<K, V> {
    name: String,
    loader: Arc<dyn ResourceLoader<K, V>>,
    aliases: ResourceAliases<K>,
    config: ResourceConfig,
    events: ResourceEvents<K>,
    state: Mutex<ResourceState<K, V>>,
    next_load_id: AtomicU64,
}

/// Key-addressed cache of server-sourced entities.
///
/// Cloning is cheap; clones share the same store.
pub struct CachedResource<K, V> {
    inner: Arc<ResourceInner<K, V>>,
}

/// Keyed map resource; the plain name for [`CachedResource`].
pub type CachedMapResource<K, V> = CachedResource<K, V>;

impl<K, V> Clone for CachedResource<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for CachedResource<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedResource")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

/// Result of releasing one use of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Freed {
    /// The key has no consumers left.
    pub released: bool,
    /// The entry was dropped from the store.
    pub evicted: bool,
}

/// Handler ids created by [`CachedResource::sync`], used to undo the wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncLinks {
    pub update: HandlerId,
    pub delete: HandlerId,
}

impl SyncLinks {
    pub fn detach<D: CacheKey>(self, dependency: &ResourceEvents<D>) {
        dependency.on_data_update.remove(self.update);
        dependency.on_item_delete.remove(self.delete);
    }
}

impl<K, V> CachedResource<K, V>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
{
    pub fn new<L>(
        name: impl Into<String>,
        loader: L,
        mut aliases: ResourceAliases<K>,
        config: ResourceConfig,
    ) -> Self
    where
        L: ResourceLoader<K, V>,
    {
        let name = name.into();
        aliases.bind(&name, config.alias_depth_limit);
        Self {
            inner: Arc::new(ResourceInner {
                name,
                loader: Arc::new(loader),
                aliases,
                config,
                events: ResourceEvents::new(),
                state: Mutex::new(ResourceState::new()),
                next_load_id: AtomicU64::new(1),
            }),
        }
    }

    /// Resource without aliases, using the default configuration.
    pub fn with_loader<L>(name: impl Into<String>, loader: L) -> Self
    where
        L: ResourceLoader<K, V>,
    {
        Self::new(name, loader, ResourceAliases::new(), ResourceConfig::default())
    }

    /// Build metadata for newly seen keys with `factory` instead of
    /// `CacheEntryMetadata::default`, e.g. to preset includes every entry
    /// is fetched with.
    pub fn with_metadata_default<F>(self, factory: F) -> Self
    where
        F: Fn(&K) -> CacheEntryMetadata + Send + Sync + 'static,
    {
        self.lock_state("with_metadata_default")
            .metadata
            .set_default(factory);
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &ResourceEvents<K> {
        &self.inner.events
    }

    pub fn aliases(&self) -> &ResourceAliases<K> {
        &self.inner.aliases
    }

    pub fn is_key_equal(&self, left: &K, right: &K) -> bool {
        self.inner.loader.is_key_equal(left, right)
    }

    /// Resolve aliases and validate every concrete key.
    pub fn resolve(&self, key: &ResourceKey<K>) -> Result<Vec<K>, ResourceError> {
        let keys = self.inner.aliases.to_list(key)?;
        for key in &keys {
            self.inner
                .loader
                .validate_key(key)
                .map_err(|reason| ResourceError::invalid_key(&self.inner.name, reason))?;
        }
        Ok(keys)
    }

    // ---- loading ----

    /// Start loading `key` without waiting for the result.
    pub fn start_load(&self, key: impl Into<ResourceKey<K>>) -> LoadHandle<K, V> {
        self.begin(&key.into(), false, &[])
    }

    /// Start a forced reload of `key`, ignoring fresh entries.
    pub fn start_refresh(&self, key: impl Into<ResourceKey<K>>) -> LoadHandle<K, V> {
        self.begin(&key.into(), true, &[])
    }

    #[instrument(skip(self, key), fields(resource = %self.inner.name))]
    pub async fn load(&self, key: impl Into<ResourceKey<K>>) -> Result<Vec<(K, V)>, ResourceError> {
        self.start_load(key).wait().await
    }

    #[instrument(skip(self), fields(resource = %self.inner.name))]
    pub async fn load_one(&self, key: K) -> Result<V, ResourceError> {
        let values = self.start_load(ResourceKey::Single(key.clone())).wait().await?;
        values
            .into_iter()
            .find_map(|(loaded, value)| (loaded == key).then_some(value))
            .ok_or_else(|| ResourceError::NotFound {
                resource: self.inner.name.clone(),
                key: format!("{key:?}"),
            })
    }

    #[instrument(skip(self, key), fields(resource = %self.inner.name))]
    pub async fn refresh(
        &self,
        key: impl Into<ResourceKey<K>>,
    ) -> Result<Vec<(K, V)>, ResourceError> {
        self.start_refresh(key).wait().await
    }

    /// Load `key`, forcing a fetch for entries that lack any of `includes`.
    #[instrument(skip(self, key), fields(resource = %self.inner.name))]
    pub async fn load_with_includes(
        &self,
        key: impl Into<ResourceKey<K>>,
        includes: &[&str],
    ) -> Result<Vec<(K, V)>, ResourceError> {
        let includes: Vec<String> = includes.iter().map(|include| include.to_string()).collect();
        self.begin(&key.into(), false, &includes).wait().await
    }

    fn begin(&self, key: &ResourceKey<K>, force: bool, includes: &[String]) -> LoadHandle<K, V> {
        let keys = match self.resolve(key) {
            Ok(keys) => keys,
            Err(error) => return LoadHandle::failed(self.clone(), error),
        };

        let mut loads: Vec<(LoadId, SharedLoad)> = Vec::new();
        let mut missing = Vec::new();
        {
            let mut guard = self.lock_state("start_load");
            let state = &mut *guard;

            for key in &keys {
                if let Some(in_flight) = state.in_flight.get(key) {
                    if !loads.iter().any(|(id, _)| *id == in_flight.id) {
                        loads.push((in_flight.id, in_flight.future.clone()));
                    }
                    continue;
                }
                if force {
                    missing.push(key.clone());
                    continue;
                }
                match state.metadata.get(key) {
                    Some(meta) if meta.outdated => missing.push(key.clone()),
                    Some(CacheEntryMetadata {
                        exception: Some(error),
                        ..
                    }) => {
                        debug!(resource = %self.inner.name, ?key, "Serving stored load error");
                        return LoadHandle::failed(self.clone(), error.clone());
                    }
                    Some(meta)
                        if meta.loaded_at.is_some()
                            && meta.has_includes(includes.iter().map(String::as_str)) => {}
                    _ => missing.push(key.clone()),
                }
            }

            if !loads.is_empty() {
                counter!(METRIC_LOAD_JOINED_TOTAL, "resource" => self.inner.name.clone())
                    .increment(loads.len() as u64);
                debug!(
                    resource = %self.inner.name,
                    joined = loads.len(),
                    "Joining in-flight load"
                );
            }

            if !missing.is_empty() {
                let id = LoadId(self.inner.next_load_id.fetch_add(1, Ordering::Relaxed));
                let (future, abort) = self.spawn_load(id, missing.clone(), includes.to_vec());
                state.metadata.update(&missing, |meta| meta.loading = true);
                for key in &missing {
                    state.in_flight.insert(
                        key.clone(),
                        InFlightLoad {
                            id,
                            future: future.clone(),
                            abort: Arc::clone(&abort),
                        },
                    );
                }
                loads.push((id, future));
                counter!(METRIC_LOAD_TOTAL, "resource" => self.inner.name.clone()).increment(1);
                debug!(
                    resource = %self.inner.name,
                    load_id = %id,
                    keys = ?missing,
                    "Starting load"
                );
            }
        }

        LoadHandle {
            resource: self.clone(),
            keys,
            loads,
            error: None,
        }
    }

    fn spawn_load(
        &self,
        id: LoadId,
        keys: Vec<K>,
        includes: Vec<String>,
    ) -> (SharedLoad, Arc<AbortHandle>) {
        let resource = self.clone();
        let panic_keys = keys.clone();
        let handle = tokio::spawn(async move { resource.run_load(id, keys, includes).await });
        let abort = Arc::new(handle.abort_handle());

        let resource = self.clone();
        let future = handle
            .then(move |joined| async move {
                match joined {
                    Ok(outcome) => outcome,
                    Err(error) if error.is_cancelled() => {
                        Err(ResourceError::cancelled(&resource.inner.name))
                    }
                    Err(error) => {
                        let error = ResourceError::load(&resource.inner.name, Box::new(error));
                        resource.settle_failure(id, &panic_keys, error.clone()).await;
                        Err(error)
                    }
                }
            })
            .boxed()
            .shared();

        (future, abort)
    }

    async fn run_load(
        self,
        id: LoadId,
        keys: Vec<K>,
        includes: Vec<String>,
    ) -> Result<(), ResourceError> {
        let started = Instant::now();
        let outcome = self.inner.loader.load_with_includes(&keys, &includes).await;
        histogram!(METRIC_LOAD_MS, "resource" => self.inner.name.clone())
            .record(started.elapsed().as_secs_f64() * 1000.0);

        let values = match outcome {
            Ok(values) => values,
            Err(source) => {
                let error = ResourceError::load(&self.inner.name, source);
                self.settle_failure(id, &keys, error.clone()).await;
                return Err(error);
            }
        };

        let updated = {
            let mut guard = self.lock_state("run_load");
            let state = &mut *guard;
            let owned = state.take_owned(id, &keys);
            let mut values: HashMap<K, V> = values.into_iter().collect();
            for key in &owned {
                match values.remove(key) {
                    Some(value) => {
                        state.store.insert(key.clone(), value);
                    }
                    None => {
                        state.store.remove(key);
                    }
                }
                let meta = state.metadata.get_or_create(key);
                meta.mark_loaded();
                meta.includes.extend(includes.iter().cloned());
            }
            owned
        };

        debug!(
            resource = %self.inner.name,
            load_id = %id,
            loaded = updated.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Load complete"
        );
        if !updated.is_empty() {
            self.inner.events.on_data_update.execute(updated).await;
        }
        Ok(())
    }

    async fn settle_failure(&self, id: LoadId, keys: &[K], error: ResourceError) {
        let failed = {
            let mut guard = self.lock_state("settle_failure");
            let state = &mut *guard;
            let owned = state.take_owned(id, keys);
            for key in &owned {
                state.metadata.get_or_create(key).mark_failed(error.clone());
            }
            owned
        };

        counter!(METRIC_LOAD_ERROR_TOTAL, "resource" => self.inner.name.clone()).increment(1);
        warn!(
            resource = %self.inner.name,
            load_id = %id,
            keys = ?failed,
            error = %error,
            "Resource load failed"
        );
        if !failed.is_empty() {
            self.inner
                .events
                .on_data_error
                .execute(LoadFailure {
                    keys: failed,
                    error,
                })
                .await;
        }
    }

    // ---- reads ----

    /// True when the store holds a value for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.lock_state("contains").store.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.lock_state("get").store.get(key).cloned()
    }

    /// Cached values for every concrete key of `key`, in key order.
    pub fn get_many(&self, key: &ResourceKey<K>) -> Result<Vec<(K, V)>, ResourceError> {
        let keys = self.resolve(key)?;
        Ok(self.values_for(&keys))
    }

    pub fn keys(&self) -> Vec<K> {
        self.lock_state("keys").store.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_state("len").store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_state("is_empty").store.is_empty()
    }

    pub fn metadata(&self, key: &K) -> Option<CacheEntryMetadata> {
        self.lock_state("metadata").metadata.get(key).cloned()
    }

    pub fn is_loading(&self, key: &K) -> bool {
        self.lock_state("is_loading")
            .metadata
            .get(key)
            .is_some_and(|meta| meta.loading)
    }

    /// True when the key finished loading and has a stored value.
    pub fn is_loaded(&self, key: &K) -> bool {
        let state = self.lock_state("is_loaded");
        state
            .metadata
            .get(key)
            .is_some_and(|meta| !meta.loading)
            && state.store.contains_key(key)
    }

    pub fn is_outdated(&self, key: &K) -> bool {
        self.lock_state("is_outdated")
            .metadata
            .get(key)
            .is_some_and(|meta| meta.outdated)
    }

    pub fn is_error(&self, key: &K) -> bool {
        self.exception(key).is_some()
    }

    pub fn exception(&self, key: &K) -> Option<ResourceError> {
        self.lock_state("exception")
            .metadata
            .get(key)
            .and_then(|meta| meta.exception.clone())
    }

    pub fn has_includes(&self, key: &K, includes: &[&str]) -> bool {
        self.lock_state("has_includes")
            .metadata
            .get(key)
            .is_some_and(|meta| meta.has_includes(includes.iter().copied()))
    }

    pub fn set_includes(&self, key: &K, includes: &[&str]) {
        let mut state = self.lock_state("set_includes");
        let meta = state.metadata.get_or_create(key);
        meta.includes
            .extend(includes.iter().map(|include| include.to_string()));
    }

    fn values_for(&self, keys: &[K]) -> Vec<(K, V)> {
        let state = self.lock_state("values_for");
        keys.iter()
            .filter_map(|key| {
                state
                    .store
                    .get(key)
                    .map(|value| (key.clone(), value.clone()))
            })
            .collect()
    }

    /// Known keys matching any of `keys` under the loader's key equality.
    pub fn matching_keys(&self, keys: &[K]) -> Vec<K> {
        let state = self.lock_state("matching_keys");
        state
            .metadata
            .keys()
            .chain(state.store.keys().filter(|key| !state.metadata.contains(key)))
            .filter(|known| keys.iter().any(|key| self.is_key_equal(known, key)))
            .cloned()
            .collect()
    }

    // ---- mutation ----

    /// Store `value` as freshly loaded and fire `on_data_update`.
    pub async fn set(&self, key: K, value: V) {
        self.set_many(vec![(key, value)]).await;
    }

    pub async fn set_many(&self, entries: Vec<(K, V)>) {
        if entries.is_empty() {
            return;
        }
        let keys = {
            let mut guard = self.lock_state("set_many");
            let state = &mut *guard;
            let mut keys = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                state.store.insert(key.clone(), value);
                state.metadata.get_or_create(&key).mark_loaded();
                keys.push(key);
            }
            keys
        };
        self.inner.events.on_data_update.execute(keys).await;
    }

    /// Flag known keys as stale and fire `on_data_outdated` once.
    ///
    /// Data stays readable; the next `load` fetches again. Returns the keys
    /// that were flagged.
    pub async fn mark_outdated(
        &self,
        key: impl Into<ResourceKey<K>>,
    ) -> Result<Vec<K>, ResourceError> {
        let keys = self.resolve(&key.into())?;
        let outdated = {
            let mut state = self.lock_state("mark_outdated");
            let known: Vec<K> = keys
                .into_iter()
                .filter(|key| state.metadata.contains(key))
                .collect();
            state.metadata.update(&known, |meta| meta.outdated = true);
            known
        };
        if !outdated.is_empty() {
            debug!(resource = %self.inner.name, keys = ?outdated, "Marked outdated");
            self.inner
                .events
                .on_data_outdated
                .execute(outdated.clone())
                .await;
        }
        Ok(outdated)
    }

    /// Clear the outdated flag of known keys and fire `on_data_update`.
    pub async fn mark_updated(
        &self,
        key: impl Into<ResourceKey<K>>,
    ) -> Result<Vec<K>, ResourceError> {
        let keys = self.resolve(&key.into())?;
        let updated = {
            let mut state = self.lock_state("mark_updated");
            let known: Vec<K> = keys
                .into_iter()
                .filter(|key| state.metadata.contains(key))
                .collect();
            state.metadata.update(&known, |meta| meta.outdated = false);
            known
        };
        if !updated.is_empty() {
            self.inner
                .events
                .on_data_update
                .execute(updated.clone())
                .await;
        }
        Ok(updated)
    }

    /// Remove entries and fire `on_item_delete` with the keys that existed.
    pub async fn delete(&self, key: impl Into<ResourceKey<K>>) -> Result<Vec<K>, ResourceError> {
        let keys = self.resolve(&key.into())?;
        let removed = {
            let mut guard = self.lock_state("delete");
            let state = &mut *guard;
            let mut removed = Vec::new();
            for key in keys {
                state.in_flight.remove(&key);
                if !state.is_known(&key) {
                    continue;
                }
                state.store.remove(&key);
                state.metadata.remove(&key);
                state.uses.remove(&key);
                removed.push(key);
            }
            removed
        };
        if !removed.is_empty() {
            debug!(resource = %self.inner.name, keys = ?removed, "Deleted entries");
            self.inner
                .events
                .on_item_delete
                .execute(removed.clone())
                .await;
        }
        Ok(removed)
    }

    /// Drop every entry and abort in-flight loads.
    ///
    /// Callers waiting on an aborted load receive [`ResourceError::Cancelled`].
    pub fn clear(&self) {
        let aborted = {
            let mut guard = self.lock_state("clear");
            let state = &mut *guard;
            let mut aborted: Vec<LoadId> = Vec::new();
            for (_, in_flight) in state.in_flight.drain() {
                if !aborted.contains(&in_flight.id) {
                    in_flight.abort.abort();
                    aborted.push(in_flight.id);
                }
            }
            state.store.clear();
            state.metadata.clear();
            state.uses.clear();
            aborted
        };
        info!(
            resource = %self.inner.name,
            aborted_loads = aborted.len(),
            "Resource cleared"
        );
    }

    // ---- consumers ----

    pub fn use_key(&self, key: K, consumer: ConsumerId) -> UseToken<K> {
        self.lock_state("use_key").uses.use_key(&key, consumer);
        UseToken { key, consumer }
    }

    /// Release one use of `key` by `consumer`.
    ///
    /// Returns true when the key has no consumers left. With
    /// `evict_on_free` enabled the entry is dropped at that point unless a
    /// load for it is still running.
    pub fn free(&self, key: &K, consumer: ConsumerId) -> bool {
        self.free_entry(key, consumer, true).released
    }

    /// Release one use and, when `evictable`, apply `evict_on_free`.
    pub(crate) fn free_entry(&self, key: &K, consumer: ConsumerId, evictable: bool) -> Freed {
        let mut guard = self.lock_state("free");
        let state = &mut *guard;
        let released = state.uses.free(key, consumer);
        let evicted = released
            && evictable
            && self.inner.config.evict_on_free
            && !state.in_flight.contains_key(key);
        if evicted {
            state.store.remove(key);
            state.metadata.remove(key);
            debug!(resource = %self.inner.name, ?key, "Evicted unused entry");
        }
        Freed { released, evicted }
    }

    pub fn release(&self, token: &UseToken<K>) -> bool {
        self.free(&token.key, token.consumer)
    }

    pub fn is_in_use(&self, key: &K) -> bool {
        self.lock_state("is_in_use").uses.is_used(key)
    }

    pub fn use_count(&self, key: &K) -> usize {
        self.lock_state("use_count").uses.count(key)
    }

    // ---- dependencies ----

    /// Follow a dependency with the same key type.
    ///
    /// An update of a dependency key outdates the matching entries here; a
    /// delete removes them. Only keys this resource already knows are touched.
    pub fn sync(&self, dependency: &ResourceEvents<K>) -> SyncLinks {
        self.sync_with(
            dependency,
            |keys: &[K]| ResourceKey::list(keys.iter().cloned()),
            |keys: &[K]| ResourceKey::list(keys.iter().cloned()),
        )
    }

    /// Follow a dependency whose keys map onto this resource's keys.
    ///
    /// `on_update` and `on_delete` translate a dependency key payload into
    /// the keys to outdate or delete here; the result may be an alias.
    pub fn sync_with<D, U, R>(&self, dependency: &ResourceEvents<D>, on_update: U, on_delete: R) -> SyncLinks
    where
        D: CacheKey,
        U: Fn(&[D]) -> ResourceKey<K> + Send + Sync + 'static,
        R: Fn(&[D]) -> ResourceKey<K> + Send + Sync + 'static,
    {
        let on_update = Arc::new(on_update);
        let weak = Arc::downgrade(&self.inner);
        let update = dependency.on_data_update.add_handler(move |keys: Vec<D>, _| {
            let weak = weak.clone();
            let on_update = Arc::clone(&on_update);
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let resource = CachedResource { inner };
                match resource.known_targets(on_update(&keys)) {
                    Ok(targets) if targets.is_empty() => {}
                    Ok(targets) => {
                        if let Err(error) = resource.mark_outdated(targets).await {
                            warn!(resource = %resource.inner.name, %error, "Dependency outdate failed");
                        }
                    }
                    Err(error) => {
                        warn!(resource = %resource.inner.name, %error, "Dependency update mapping failed");
                    }
                }
            }
        });

        let on_delete = Arc::new(on_delete);
        let weak = Arc::downgrade(&self.inner);
        let delete = dependency.on_item_delete.add_handler(move |keys: Vec<D>, _| {
            let weak = weak.clone();
            let on_delete = Arc::clone(&on_delete);
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let resource = CachedResource { inner };
                match resource.known_targets(on_delete(&keys)) {
                    Ok(targets) if targets.is_empty() => {}
                    Ok(targets) => {
                        if let Err(error) = resource.delete(targets).await {
                            warn!(resource = %resource.inner.name, %error, "Dependency delete failed");
                        }
                    }
                    Err(error) => {
                        warn!(resource = %resource.inner.name, %error, "Dependency delete mapping failed");
                    }
                }
            }
        });

        SyncLinks { update, delete }
    }

    fn known_targets(&self, key: ResourceKey<K>) -> Result<Vec<K>, ResourceError> {
        let keys = self.resolve(&key)?;
        Ok(self.matching_keys(&keys))
    }

    fn lock_state(&self, op: &'static str) -> MutexGuard<'_, ResourceState<K, V>> {
        mutex_lock(&self.inner.state, SOURCE, op)
    }
}

/// Pending result of [`CachedResource::start_load`].
///
/// Handles started while a load for the same keys is in flight refer to the
/// same load; see [`same_load`](Self::same_load).
pub struct LoadHandle<K, V> {
    resource: CachedResource<K, V>,
    keys: Vec<K>,
    loads: Vec<(LoadId, SharedLoad)>,
    error: Option<ResourceError>,
}

impl<K, V> LoadHandle<K, V>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
{
    fn failed(resource: CachedResource<K, V>, error: ResourceError) -> Self {
        Self {
            resource,
            keys: Vec::new(),
            loads: Vec::new(),
            error: Some(error),
        }
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    pub fn load_ids(&self) -> Vec<LoadId> {
        let mut ids: Vec<LoadId> = self.loads.iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids
    }

    /// True when every key was served from the cache.
    pub fn is_cached(&self) -> bool {
        self.loads.is_empty() && self.error.is_none()
    }

    /// True when both handles wait on exactly the same loader invocations.
    pub fn same_load(&self, other: &Self) -> bool {
        !self.loads.is_empty() && self.load_ids() == other.load_ids()
    }

    pub async fn wait(self) -> Result<Vec<(K, V)>, ResourceError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        for (_, load) in self.loads {
            load.await?;
        }
        Ok(self.resource.values_for(&self.keys))
    }
}

impl<K, V> IntoFuture for LoadHandle<K, V>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
{
    type Output = Result<Vec<(K, V)>, ResourceError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait().boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::resource::error::BoxError;
    use crate::resource::keys::{ALL, ResourceAlias};

    #[derive(Default)]
    struct CountingLoader {
        calls: AtomicUsize,
        batches: Mutex<Vec<Vec<u32>>>,
        fail: std::sync::atomic::AtomicBool,
        delay: Duration,
    }

    impl CountingLoader {
        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ResourceLoader<u32, String> for Arc<CountingLoader> {
        async fn load(&self, keys: &[u32]) -> Result<Vec<(u32, String)>, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().unwrap().push(keys.to_vec());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err("backend unavailable".into());
            }
            Ok(keys
                .iter()
                .filter(|key| **key != 404)
                .map(|key| (*key, format!("user-{key}")))
                .collect())
        }

        fn validate_key(&self, key: &u32) -> Result<(), String> {
            if *key == 0 {
                return Err("id must be positive".to_string());
            }
            Ok(())
        }
    }

    fn resource(loader: &Arc<CountingLoader>) -> CachedResource<u32, String> {
        let aliases = ResourceAliases::new().add("all", |_| ResourceKey::list([1, 2, 3]));
        CachedResource::new("users", Arc::clone(loader), aliases, ResourceConfig::default())
    }

    #[tokio::test]
    async fn cached_values_skip_the_loader() {
        let loader = Arc::new(CountingLoader::default());
        let users = resource(&loader);

        assert_eq!(users.load_one(1).await.unwrap(), "user-1");
        assert_eq!(users.load_one(1).await.unwrap(), "user-1");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(users.is_loaded(&1));
    }

    #[tokio::test]
    async fn set_then_load_does_not_call_loader() {
        let loader = Arc::new(CountingLoader::default());
        let users = resource(&loader);

        users.set(7, "preset".to_string()).await;
        assert_eq!(users.load_one(7).await.unwrap(), "preset");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_start_load_shares_one_load() {
        let loader = Arc::new(CountingLoader::slow(Duration::from_millis(100)));
        let users = resource(&loader);

        let first = users.start_load(1);
        let second = users.start_load(1);
        assert!(first.same_load(&second));
        assert!(users.is_loading(&1));

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(!users.is_loading(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_requests_only_load_missing_keys() {
        let loader = Arc::new(CountingLoader::slow(Duration::from_millis(50)));
        let users = resource(&loader);

        let first = users.start_load(vec![1, 2]);
        let second = users.start_load(vec![2, 3]);
        assert!(!first.same_load(&second));

        let values = second.await.unwrap();
        assert_eq!(values.len(), 2);
        first.await.unwrap();

        assert_eq!(*loader.batches.lock().unwrap(), vec![vec![1, 2], vec![3]]);
    }

    #[tokio::test]
    async fn alias_all_loads_in_one_batch() {
        let loader = Arc::new(CountingLoader::default());
        let users = resource(&loader);

        let values = users.load(ResourceKey::alias(ALL)).await.unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(*loader.batches.lock().unwrap(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn unsupported_alias_and_invalid_key_fail_fast() {
        let loader = Arc::new(CountingLoader::default());
        let users = resource(&loader);

        let err = users
            .load(ResourceKey::alias(ResourceAlias::new("recent")))
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::UnsupportedAlias { .. }));

        let err = users.load_one(0).await.unwrap_err();
        assert!(matches!(err, ResourceError::InvalidKey { .. }));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_value_is_not_found() {
        let loader = Arc::new(CountingLoader::default());
        let users = resource(&loader);

        let err = users.load_one(404).await.unwrap_err();
        assert!(matches!(err, ResourceError::NotFound { .. }));
        assert!(!users.is_loaded(&404));
        assert!(!users.is_loading(&404));
    }

    #[tokio::test]
    async fn failure_is_stored_and_reported_without_retry() {
        let loader = Arc::new(CountingLoader::default());
        loader.fail.store(true, Ordering::SeqCst);
        let users = resource(&loader);
        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&failures);
        users.events().on_data_error.add_handler(move |failure: LoadFailure<u32>, _| {
            let seen = Arc::clone(&seen);
            async move { seen.lock().unwrap().push(failure.keys) }
        });

        assert!(matches!(users.load_one(5).await, Err(ResourceError::Load { .. })));
        assert!(users.is_error(&5));
        assert!(matches!(users.load_one(5).await, Err(ResourceError::Load { .. })));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*failures.lock().unwrap(), vec![vec![5]]);

        loader.fail.store(false, Ordering::SeqCst);
        assert_eq!(users.refresh(5).await.unwrap().len(), 1);
        assert!(!users.is_error(&5));
    }

    #[tokio::test]
    async fn mark_outdated_fires_once_and_keeps_data() {
        let loader = Arc::new(CountingLoader::default());
        let users = resource(&loader);
        users.load(vec![1, 2]).await.unwrap();

        let fired = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&fired);
        users.events().on_data_outdated.add_handler(move |keys: Vec<u32>, _| {
            let seen = Arc::clone(&seen);
            async move { seen.lock().unwrap().push(keys) }
        });

        let outdated = users.mark_outdated(vec![1, 2, 99]).await.unwrap();
        assert_eq!(outdated.len(), 2);
        assert_eq!(fired.lock().unwrap().len(), 1);
        assert!(users.is_outdated(&1));
        assert_eq!(users.get(&1).as_deref(), Some("user-1"));

        users.load(vec![1, 2]).await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
        assert!(!users.is_outdated(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_waiters() {
        let loader = Arc::new(CountingLoader::slow(Duration::from_secs(10)));
        let users = resource(&loader);

        let pending = users.start_load(1);
        tokio::task::yield_now().await;
        users.clear();

        let err = pending.await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(users.is_empty());
        assert!(users.metadata(&1).is_none());
    }

    #[tokio::test]
    async fn delete_fires_event_with_existing_keys() {
        let loader = Arc::new(CountingLoader::default());
        let users = resource(&loader);
        users.load(vec![1, 2]).await.unwrap();

        let deleted = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&deleted);
        users.events().on_item_delete.add_handler(move |keys: Vec<u32>, _| {
            let seen = Arc::clone(&seen);
            async move { seen.lock().unwrap().extend(keys) }
        });

        users.delete(vec![2, 3]).await.unwrap();
        assert_eq!(*deleted.lock().unwrap(), vec![2]);
        assert!(users.get(&2).is_none());
        assert!(users.get(&1).is_some());
    }

    #[tokio::test]
    async fn includes_force_a_fetch_when_missing() {
        let loader = Arc::new(CountingLoader::default());
        let users = resource(&loader);

        users.load_one(1).await.unwrap();
        assert!(!users.has_includes(&1, &["avatar"]));

        users.load_with_includes(1, &["avatar"]).await.unwrap();
        assert!(users.has_includes(&1, &["avatar"]));
        users.load_with_includes(1, &["avatar"]).await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn use_and_free_are_symmetric() {
        let loader = Arc::new(CountingLoader::default());
        let users: CachedResource<u32, String> = CachedResource::new(
            "users",
            Arc::clone(&loader),
            ResourceAliases::new(),
            ResourceConfig::default().with_evict_on_free(true),
        );
        users.load_one(1).await.unwrap();

        let a = ConsumerId::new();
        let b = ConsumerId::new();
        users.use_key(1, a);
        let token = users.use_key(1, b);
        assert_eq!(users.use_count(&1), 2);

        assert!(!users.free(&1, ConsumerId::new()));
        assert!(!users.free(&1, a));
        assert!(users.get(&1).is_some());

        assert!(users.release(&token));
        assert!(!users.is_in_use(&1));
        assert!(users.get(&1).is_none());
    }

    #[tokio::test]
    async fn metadata_factory_seeds_new_entries() {
        let loader = Arc::new(CountingLoader::default());
        let users = resource(&loader).with_metadata_default(|_: &u32| CacheEntryMetadata {
            includes: ["profile".to_string()].into_iter().collect(),
            ..CacheEntryMetadata::default()
        });

        users.load_one(1).await.unwrap();
        assert!(users.has_includes(&1, &["profile"]));

        users.load_with_includes(1, &["profile"]).await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        users.clear();
        users.set(2, "manual".to_string()).await;
        assert!(users.has_includes(&2, &["profile"]));
    }
}
