//! Loader seams implemented by the surrounding application.
//!
//! A loader wraps the transport call that fetches entities; resources only
//! decide when it runs and for which keys.

use async_trait::async_trait;

use super::error::BoxError;
use super::keys::CacheKey;

/// Fetches values for a batch of concrete keys.
#[async_trait]
pub trait ResourceLoader<K, V>: Send + Sync + 'static
where
    K: CacheKey,
    V: Send + 'static,
{
    /// Fetch every key in `keys`. Keys missing from the result are treated
    /// as known-absent.
    async fn load(&self, keys: &[K]) -> Result<Vec<(K, V)>, BoxError>;

    /// Fetch `keys` together with optional sub-fields named by `includes`.
    async fn load_with_includes(
        &self,
        keys: &[K],
        _includes: &[String],
    ) -> Result<Vec<(K, V)>, BoxError> {
        self.load(keys).await
    }

    /// Reject keys the backend can never serve before any call is made.
    fn validate_key(&self, _key: &K) -> Result<(), String> {
        Ok(())
    }

    /// Equality used for dependency matching and key intersection.
    fn is_key_equal(&self, left: &K, right: &K) -> bool {
        left == right
    }
}

/// Fetches the value of a single-value resource.
#[async_trait]
pub trait DataLoader<V>: Send + Sync + 'static
where
    V: Send + 'static,
{
    async fn load(&self) -> Result<V, BoxError>;
}

/// Adapts a [`DataLoader`] to the keyed loader the core expects.
pub(crate) struct UnitLoader<L>(pub(crate) L);

#[async_trait]
impl<L, V> ResourceLoader<(), V> for UnitLoader<L>
where
    L: DataLoader<V>,
    V: Send + 'static,
{
    async fn load(&self, _keys: &[()]) -> Result<Vec<((), V)>, BoxError> {
        Ok(vec![((), self.0.load().await?)])
    }
}

/// Loader built from an async closure.
pub struct FnLoader<F>(F);

impl<F> FnLoader<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<K, V, F, Fut> ResourceLoader<K, V> for FnLoader<F>
where
    K: CacheKey,
    V: Send + 'static,
    F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Vec<(K, V)>, BoxError>> + Send + 'static,
{
    async fn load(&self, keys: &[K]) -> Result<Vec<(K, V)>, BoxError> {
        (self.0)(keys.to_vec()).await
    }
}
