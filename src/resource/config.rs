//! Resource configuration.
//!
//! Tunables shared by every resource built from one settings file.

use serde::Deserialize;

use super::keys::DEFAULT_ALIAS_DEPTH_LIMIT;

/// Per-resource behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Maximum alias-to-alias hops before resolution fails.
    pub alias_depth_limit: usize,
    /// Drop an entry as soon as its last consumer frees it.
    pub evict_on_free: bool,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            alias_depth_limit: DEFAULT_ALIAS_DEPTH_LIMIT,
            evict_on_free: false,
        }
    }
}

impl From<&crate::config::ResourceSettings> for ResourceConfig {
    fn from(settings: &crate::config::ResourceSettings) -> Self {
        Self {
            alias_depth_limit: settings.alias_depth_limit.get(),
            evict_on_free: settings.evict_on_free,
        }
    }
}

impl ResourceConfig {
    pub fn with_evict_on_free(mut self, evict_on_free: bool) -> Self {
        self.evict_on_free = evict_on_free;
        self
    }

    pub fn with_alias_depth_limit(mut self, alias_depth_limit: usize) -> Self {
        self.alias_depth_limit = alias_depth_limit.max(1);
        self
    }
}
