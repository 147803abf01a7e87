use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error returned by loaders supplied by the surrounding application.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors surfaced by cache resources.
///
/// The type is `Clone` because every caller sharing one in-flight load must
/// observe the same failure.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    #[error("resource `{resource}` does not support alias `{alias}`")]
    UnsupportedAlias { resource: String, alias: String },
    #[error("alias `{alias}` did not resolve to a concrete key within {depth} steps")]
    AliasCycle { alias: String, depth: usize },
    #[error("invalid key for resource `{resource}`: {reason}")]
    InvalidKey { resource: String, reason: String },
    #[error("loader for resource `{resource}` failed: {source}")]
    Load {
        resource: String,
        #[source]
        source: Arc<dyn StdError + Send + Sync + 'static>,
    },
    #[error("load for resource `{resource}` was cancelled")]
    Cancelled { resource: String },
    #[error("resource `{resource}` has no value for key {key}")]
    NotFound { resource: String, key: String },
}

impl ResourceError {
    pub fn unsupported_alias(resource: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::UnsupportedAlias {
            resource: resource.into(),
            alias: alias.into(),
        }
    }

    pub fn invalid_key(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    pub fn load(resource: impl Into<String>, source: BoxError) -> Self {
        Self::Load {
            resource: resource.into(),
            source: Arc::from(source),
        }
    }

    pub fn cancelled(resource: impl Into<String>) -> Self {
        Self::Cancelled {
            resource: resource.into(),
        }
    }

    /// Programmer errors are raised before any loader runs and are never
    /// stored in entry metadata.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedAlias { .. } | Self::AliasCycle { .. } | Self::InvalidKey { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
