//! Resource key model.
//!
//! A resource is addressed by a single concrete key, an ordered list of
//! concrete keys, or a symbolic [`ResourceAlias`] that a [`ResourceAliases`]
//! registry resolves before any store lookup happens.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use super::error::ResourceError;

/// Default number of alias-to-alias hops before resolution gives up.
pub const DEFAULT_ALIAS_DEPTH_LIMIT: usize = 8;

/// Bounds shared by every concrete key type.
pub trait CacheKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Symbolic key such as "everything" or "children of X".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceAlias {
    name: Cow<'static, str>,
    param: Option<String>,
}

/// Alias asking for every entity the resource can produce.
pub const ALL: ResourceAlias = ResourceAlias::new("all");

impl ResourceAlias {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            param: None,
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param(&self) -> Option<&str> {
        self.param.as_deref()
    }
}

impl fmt::Display for ResourceAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.param {
            Some(param) => write!(f, "{}({param})", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Ordered list of concrete keys; duplicates are dropped on insert.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKeyList<K>(Vec<K>);

impl<K: PartialEq> ResourceKeyList<K> {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append `key` unless an equal key is already present.
    pub fn push(&mut self, key: K) -> bool {
        if self.0.contains(&key) {
            return false;
        }
        self.0.push(key);
        true
    }
}

impl<K> ResourceKeyList<K> {
    pub fn as_slice(&self) -> &[K] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, K> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<K> {
        self.0
    }
}

impl<K: PartialEq> Default for ResourceKeyList<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PartialEq> FromIterator<K> for ResourceKeyList<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let mut list = Self::new();
        for key in iter {
            list.push(key);
        }
        list
    }
}

/// Any key shape accepted by resource operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey<K> {
    Single(K),
    List(ResourceKeyList<K>),
    Alias(ResourceAlias),
}

impl<K: PartialEq> ResourceKey<K> {
    pub fn single(key: K) -> Self {
        Self::Single(key)
    }

    pub fn list(keys: impl IntoIterator<Item = K>) -> Self {
        Self::List(keys.into_iter().collect())
    }

    pub fn alias(alias: ResourceAlias) -> Self {
        Self::Alias(alias)
    }

    pub fn is_alias(&self) -> bool {
        matches!(self, Self::Alias(_))
    }
}

impl<K: PartialEq> From<Vec<K>> for ResourceKey<K> {
    fn from(keys: Vec<K>) -> Self {
        Self::list(keys)
    }
}

impl<K> From<K> for ResourceKey<K> {
    fn from(key: K) -> Self {
        Self::Single(key)
    }
}

/// Resolves an alias into another key shape. The result may itself be an
/// alias; resolution repeats until a concrete key is reached.
pub type AliasResolver<K> = Arc<dyn Fn(&ResourceAlias) -> ResourceKey<K> + Send + Sync>;

/// Registry of alias resolvers for one resource.
pub struct ResourceAliases<K> {
    owner: String,
    resolvers: HashMap<String, AliasResolver<K>>,
    depth_limit: usize,
}

impl<K: CacheKey> ResourceAliases<K> {
    pub fn new() -> Self {
        Self {
            owner: String::new(),
            resolvers: HashMap::new(),
            depth_limit: DEFAULT_ALIAS_DEPTH_LIMIT,
        }
    }

    /// Register `resolver` for every alias named `name`, whatever its parameter.
    pub fn add<F>(mut self, name: impl Into<String>, resolver: F) -> Self
    where
        F: Fn(&ResourceAlias) -> ResourceKey<K> + Send + Sync + 'static,
    {
        self.resolvers.insert(name.into(), Arc::new(resolver));
        self
    }

    pub fn with_depth_limit(mut self, depth_limit: usize) -> Self {
        self.depth_limit = depth_limit.max(1);
        self
    }

    pub(crate) fn bind(&mut self, owner: &str, depth_limit: usize) {
        self.owner = owner.to_string();
        self.depth_limit = depth_limit.max(1);
    }

    pub fn supports(&self, alias: &ResourceAlias) -> bool {
        self.resolvers.contains_key(alias.name())
    }

    /// Resolve `key` to a single key or key list; never returns an alias.
    pub fn resolve(&self, key: &ResourceKey<K>) -> Result<ResourceKey<K>, ResourceError> {
        let mut current = key.clone();
        let mut depth = 0;

        while let ResourceKey::Alias(alias) = &current {
            if depth >= self.depth_limit {
                return Err(ResourceError::AliasCycle {
                    alias: alias.to_string(),
                    depth,
                });
            }
            let resolver = self
                .resolvers
                .get(alias.name())
                .ok_or_else(|| ResourceError::unsupported_alias(&self.owner, alias.to_string()))?;
            current = resolver(alias);
            depth += 1;
        }

        Ok(current)
    }

    /// Flatten any key shape into an ordered, de-duplicated list of concrete keys.
    pub fn to_list(&self, key: &ResourceKey<K>) -> Result<Vec<K>, ResourceError> {
        Ok(match self.resolve(key)? {
            ResourceKey::Single(key) => vec![key],
            ResourceKey::List(list) => list.into_vec(),
            ResourceKey::Alias(alias) => {
                return Err(ResourceError::AliasCycle {
                    alias: alias.to_string(),
                    depth: self.depth_limit,
                });
            }
        })
    }

    pub fn for_each<F>(&self, key: &ResourceKey<K>, mut f: F) -> Result<(), ResourceError>
    where
        F: FnMut(K),
    {
        for key in self.to_list(key)? {
            f(key);
        }
        Ok(())
    }

    /// Visit every concrete key, awaiting each step before starting the next.
    pub async fn for_each_async<F, Fut, E>(&self, key: &ResourceKey<K>, mut f: F) -> Result<(), E>
    where
        F: FnMut(K) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<ResourceError>,
    {
        for key in self.to_list(key)? {
            f(key).await?;
        }
        Ok(())
    }

    /// True if any concrete key of `a` matches any concrete key of `b` under `eq`.
    pub fn is_intersect<F>(
        &self,
        a: &ResourceKey<K>,
        b: &ResourceKey<K>,
        eq: F,
    ) -> Result<bool, ResourceError>
    where
        F: Fn(&K, &K) -> bool,
    {
        let left = self.to_list(a)?;
        let right = self.to_list(b)?;
        Ok(is_intersect(&left, &right, eq))
    }

    /// True if `concrete` is one of the keys `key` resolves to.
    pub fn includes<F>(&self, key: &ResourceKey<K>, concrete: &K, eq: F) -> Result<bool, ResourceError>
    where
        F: Fn(&K, &K) -> bool,
    {
        Ok(self.to_list(key)?.iter().any(|candidate| eq(candidate, concrete)))
    }
}

impl<K: CacheKey> Default for ResourceAliases<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// True if any key in `a` matches a key in `b` under `eq`.
pub fn is_intersect<K, F>(a: &[K], b: &[K], eq: F) -> bool
where
    F: Fn(&K, &K) -> bool,
{
    a.iter().any(|left| b.iter().any(|right| eq(left, right)))
}
