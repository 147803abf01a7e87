//! Change notifications published by a resource.

use crate::executor::Executor;

use super::error::ResourceError;
use super::keys::CacheKey;

/// Payload of `on_data_error`: the keys of one failed load and its error.
#[derive(Debug, Clone)]
pub struct LoadFailure<K> {
    pub keys: Vec<K>,
    pub error: ResourceError,
}

/// Executors a resource fires when its entries change.
///
/// Every key payload is the list of concrete keys affected by one mutation,
/// so a single `mark_outdated` over many keys fires exactly once.
pub struct ResourceEvents<K> {
    pub on_data_update: Executor<Vec<K>>,
    pub on_data_outdated: Executor<Vec<K>>,
    pub on_item_delete: Executor<Vec<K>>,
    pub on_data_error: Executor<LoadFailure<K>>,
}

impl<K: CacheKey> ResourceEvents<K> {
    pub fn new() -> Self {
        Self {
            on_data_update: Executor::new(),
            on_data_outdated: Executor::new(),
            on_item_delete: Executor::new(),
            on_data_error: Executor::new(),
        }
    }
}

impl<K: CacheKey> Default for ResourceEvents<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for ResourceEvents<K> {
    fn clone(&self) -> Self {
        Self {
            on_data_update: self.on_data_update.clone(),
            on_data_outdated: self.on_data_outdated.clone(),
            on_item_delete: self.on_item_delete.clone(),
            on_data_error: self.on_data_error.clone(),
        }
    }
}
