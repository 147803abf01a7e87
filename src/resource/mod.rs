//! Key-addressed resource caches.
//!
//! A resource caches server-sourced entities by key, deduplicates concurrent
//! loads, tracks which consumers hold which entries, and publishes change
//! events other resources can follow through `sync`.

pub mod config;
mod core;
mod data;
pub mod error;
mod events;
pub mod keys;
mod loader;
pub mod metadata;
mod tree;
pub mod use_tracker;

pub use config::ResourceConfig;
pub use core::{CachedMapResource, CachedResource, LoadHandle, LoadId, SyncLinks};
pub use data::CachedDataResource;
pub use error::{BoxError, ResourceError};
pub use events::{LoadFailure, ResourceEvents};
pub use keys::{ALL, CacheKey, ResourceAlias, ResourceAliases, ResourceKey, ResourceKeyList};
pub use loader::{DataLoader, FnLoader, ResourceLoader};
pub use metadata::{CacheEntryMetadata, MetadataMap};
pub use tree::{CachedTreeResource, TreePath};
pub use use_tracker::{ConsumerId, UseToken, UseTracker};
