//! Single-value resource.

use super::config::ResourceConfig;
use super::core::{CachedResource, LoadHandle};
use super::error::ResourceError;
use super::events::ResourceEvents;
use super::keys::{ResourceAliases, ResourceKey};
use super::loader::{DataLoader, UnitLoader};
use super::use_tracker::{ConsumerId, UseToken};

/// Cache for one value, such as the current user or site settings.
///
/// Backed by a [`CachedResource`] keyed by `()`, so loads of the value are
/// deduplicated the same way keyed loads are.
pub struct CachedDataResource<V> {
    core: CachedResource<(), V>,
}

impl<V> Clone for CachedDataResource<V> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<V> CachedDataResource<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new<L>(name: impl Into<String>, loader: L, config: ResourceConfig) -> Self
    where
        L: DataLoader<V>,
    {
        Self {
            core: CachedResource::new(name, UnitLoader(loader), ResourceAliases::new(), config),
        }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn events(&self) -> &ResourceEvents<()> {
        self.core.events()
    }

    /// The keyed core, for wiring with `sync`.
    pub fn core(&self) -> &CachedResource<(), V> {
        &self.core
    }

    pub fn start_load(&self) -> LoadHandle<(), V> {
        self.core.start_load(())
    }

    pub async fn load(&self) -> Result<V, ResourceError> {
        self.core.load_one(()).await
    }

    pub async fn refresh(&self) -> Result<V, ResourceError> {
        self.core
            .refresh(())
            .await?
            .into_iter()
            .next()
            .map(|(_, value)| value)
            .ok_or_else(|| ResourceError::NotFound {
                resource: self.core.name().to_string(),
                key: "()".to_string(),
            })
    }

    /// The cached value, without loading.
    pub fn data(&self) -> Option<V> {
        self.core.get(&())
    }

    pub async fn set(&self, value: V) {
        self.core.set((), value).await;
    }

    pub fn clear(&self) {
        self.core.clear();
    }

    /// Flag the value as stale; returns true when a value was known.
    pub async fn mark_outdated(&self) -> Result<bool, ResourceError> {
        let outdated = self.core.mark_outdated(ResourceKey::Single(())).await?;
        Ok(!outdated.is_empty())
    }

    pub async fn mark_updated(&self) -> Result<bool, ResourceError> {
        let updated = self.core.mark_updated(ResourceKey::Single(())).await?;
        Ok(!updated.is_empty())
    }

    pub fn is_loaded(&self) -> bool {
        self.core.is_loaded(&())
    }

    pub fn is_loading(&self) -> bool {
        self.core.is_loading(&())
    }

    pub fn is_outdated(&self) -> bool {
        self.core.is_outdated(&())
    }

    pub fn is_error(&self) -> bool {
        self.core.is_error(&())
    }

    pub fn exception(&self) -> Option<ResourceError> {
        self.core.exception(&())
    }

    pub fn use_value(&self, consumer: ConsumerId) -> UseToken<()> {
        self.core.use_key((), consumer)
    }

    pub fn free(&self, consumer: ConsumerId) -> bool {
        self.core.free(&(), consumer)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::resource::error::BoxError;

    struct Settings {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DataLoader<String> for Settings {
        async fn load(&self) -> Result<String, BoxError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(format!("settings v{call}"))
        }
    }

    fn settings() -> (CachedDataResource<String>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let resource = CachedDataResource::new(
            "settings",
            Settings {
                calls: Arc::clone(&calls),
            },
            ResourceConfig::default(),
        );
        (resource, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_loads_share_one_call() {
        let (settings, calls) = settings();

        let (a, b) = tokio::join!(settings.load(), settings.load());
        assert_eq!(a.unwrap(), "settings v1");
        assert_eq!(b.unwrap(), "settings v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(settings.is_loaded());
    }

    #[tokio::test(start_paused = true)]
    async fn outdated_value_reloads_on_next_load() {
        let (settings, calls) = settings();
        settings.load().await.unwrap();

        assert!(settings.mark_outdated().await.unwrap());
        assert!(settings.is_outdated());
        assert_eq!(settings.data().as_deref(), Some("settings v1"));

        assert_eq!(settings.load().await.unwrap(), "settings v2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn set_value_is_served_without_loading() {
        let (settings, calls) = settings();
        settings.set("manual".to_string()).await;

        assert_eq!(settings.load().await.unwrap(), "manual");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        settings.clear();
        assert!(settings.data().is_none());
    }

    #[tokio::test]
    async fn outdate_and_update_report_whether_a_value_was_known() {
        let (settings, _) = settings();
        assert!(!settings.mark_outdated().await.unwrap());
        assert!(!settings.mark_updated().await.unwrap());

        settings.set("manual".to_string()).await;
        assert!(settings.mark_outdated().await.unwrap());
        assert!(settings.mark_updated().await.unwrap());
        assert!(!settings.is_outdated());
    }
}
