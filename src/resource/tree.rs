//! Hierarchical resource keyed by slash-separated paths.

use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::lock::mutex_lock;

use super::config::ResourceConfig;
use super::core::CachedResource;
use super::error::ResourceError;
use super::events::ResourceEvents;
use super::keys::{ResourceAliases, ResourceKey};
use super::loader::ResourceLoader;
use super::use_tracker::{ConsumerId, UseToken};

const SOURCE: &str = "resource::tree";

/// Location of a node; the root is the empty path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreePath {
    segments: Vec<String>,
}

impl TreePath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse `a/b/c`; empty segments are ignored.
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, parent) = self.segments.split_last()?;
        Some(Self {
            segments: parent.to_vec(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Every path from the root down to and including this one.
    pub fn chain(&self) -> Vec<Self> {
        (0..=self.segments.len())
            .map(|len| Self {
                segments: self.segments[..len].to_vec(),
            })
            .collect()
    }

    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        self.segments.len() < other.segments.len() && other.segments.starts_with(&self.segments)
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl FromStr for TreePath {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for TreePath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

/// Parent to children index for the nodes a tree resource has seen.
#[derive(Debug, Default)]
struct TreeIndex {
    children: HashMap<TreePath, BTreeSet<TreePath>>,
}

impl TreeIndex {
    fn register(&mut self, path: &TreePath) {
        let mut current = path.clone();
        while let Some(parent) = current.parent() {
            let inserted = self
                .children
                .entry(parent.clone())
                .or_default()
                .insert(current);
            if !inserted {
                break;
            }
            current = parent;
        }
    }

    fn children(&self, path: &TreePath) -> Vec<TreePath> {
        self.children
            .get(path)
            .map(|children| children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Detach `path` and everything below it; returns the removed paths,
    /// parents before children.
    fn remove_subtree(&mut self, path: &TreePath) -> Vec<TreePath> {
        if let Some(parent) = path.parent()
            && let Some(siblings) = self.children.get_mut(&parent)
        {
            siblings.remove(path);
            if siblings.is_empty() {
                self.children.remove(&parent);
            }
        }

        let mut removed = Vec::new();
        let mut stack = vec![path.clone()];
        while let Some(node) = stack.pop() {
            if let Some(children) = self.children.remove(&node) {
                stack.extend(children.into_iter().rev());
            }
            removed.push(node);
        }
        removed
    }

    fn clear(&mut self) {
        self.children.clear();
    }
}

/// Cache of values arranged in a tree, such as folders or nested comments.
pub struct CachedTreeResource<V> {
    core: CachedResource<TreePath, V>,
    index: Arc<Mutex<TreeIndex>>,
}

impl<V> Clone for CachedTreeResource<V> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            index: Arc::clone(&self.index),
        }
    }
}

impl<V> CachedTreeResource<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new<L>(name: impl Into<String>, loader: L, config: ResourceConfig) -> Self
    where
        L: ResourceLoader<TreePath, V>,
    {
        Self {
            core: CachedResource::new(name, loader, ResourceAliases::new(), config),
            index: Arc::new(Mutex::new(TreeIndex::default())),
        }
    }

    pub fn core(&self) -> &CachedResource<TreePath, V> {
        &self.core
    }

    pub fn events(&self) -> &ResourceEvents<TreePath> {
        self.core.events()
    }

    /// Value at `path`, creating it and any missing ancestors with `default`.
    ///
    /// Created nodes are announced in one `on_data_update` firing.
    pub async fn get_or_create<F>(&self, path: &TreePath, default: F) -> V
    where
        F: Fn(&TreePath) -> V,
    {
        let mut created = Vec::new();
        let mut value = None;
        for node in path.chain() {
            let current = match self.core.get(&node) {
                Some(existing) => existing,
                None => {
                    let fresh = default(&node);
                    created.push((node.clone(), fresh.clone()));
                    fresh
                }
            };
            if node == *path {
                value = Some(current);
            }
        }

        self.register(path);
        if !created.is_empty() {
            debug!(resource = %self.core.name(), %path, created = created.len(), "Created tree nodes");
            self.core.set_many(created).await;
        }
        match value {
            Some(value) => value,
            None => default(path),
        }
    }

    /// Value at `path` if present; never creates nodes.
    pub fn get_value(&self, path: &TreePath) -> Option<V> {
        self.core.get(path)
    }

    pub async fn load(&self, path: &TreePath) -> Result<V, ResourceError> {
        let value = self.core.load_one(path.clone()).await?;
        self.register(path);
        Ok(value)
    }

    pub async fn refresh(&self, path: &TreePath) -> Result<Vec<(TreePath, V)>, ResourceError> {
        self.core.refresh(path.clone()).await
    }

    pub async fn set(&self, path: &TreePath, value: V) {
        self.register(path);
        self.core.set(path.clone(), value).await;
    }

    pub fn children(&self, path: &TreePath) -> Vec<TreePath> {
        mutex_lock(&self.index, SOURCE, "children").children(path)
    }

    pub fn parent(&self, path: &TreePath) -> Option<TreePath> {
        path.parent()
    }

    /// Record a use of `path` and of every ancestor up to the root.
    pub fn use_path(&self, path: &TreePath, consumer: ConsumerId) -> UseToken<TreePath> {
        for node in path.chain() {
            self.core.use_key(node, consumer);
        }
        UseToken {
            key: path.clone(),
            consumer,
        }
    }

    /// Release `consumer` from `path` and its ancestors.
    ///
    /// Returns true when `path` itself has no consumers left. With
    /// `evict_on_free`, a released node is evicted only once no child of it
    /// holds a value, and evicted nodes leave the child index.
    pub fn free_path(&self, path: &TreePath, consumer: ConsumerId) -> bool {
        let mut released = false;
        for node in path.chain().iter().rev() {
            let evictable = !self.has_cached_children(node);
            let freed = self.core.free_entry(node, consumer, evictable);
            if freed.evicted {
                mutex_lock(&self.index, SOURCE, "free_path").remove_subtree(node);
            }
            if node == path {
                released = freed.released;
            }
        }
        released
    }

    fn has_cached_children(&self, path: &TreePath) -> bool {
        let children = mutex_lock(&self.index, SOURCE, "has_cached_children").children(path);
        children.iter().any(|child| self.core.contains(child))
    }

    pub fn is_in_use(&self, path: &TreePath) -> bool {
        self.core.is_in_use(path)
    }

    pub async fn mark_outdated(&self, path: &TreePath) -> Result<Vec<TreePath>, ResourceError> {
        self.core.mark_outdated(ResourceKey::Single(path.clone())).await
    }

    /// Remove `path` with its whole subtree; `on_item_delete` receives every
    /// removed path that held data.
    pub async fn delete(&self, path: &TreePath) -> Result<Vec<TreePath>, ResourceError> {
        let subtree = mutex_lock(&self.index, SOURCE, "delete").remove_subtree(path);
        self.core.delete(subtree).await
    }

    pub fn clear(&self) {
        mutex_lock(&self.index, SOURCE, "clear").clear();
        self.core.clear();
    }

    fn register(&self, path: &TreePath) {
        mutex_lock(&self.index, SOURCE, "register").register(path);
    }
}
