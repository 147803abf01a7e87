use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::resource::BoxError;

/// Terminal failure of a [`Task`](super::Task).
///
/// `Clone` so every waiter of a shared task sees the same outcome.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("task cancelled: {reason}")]
    Cancelled { reason: String },
    #[error("task timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("task failed: {0}")]
    Failed(#[source] Arc<dyn StdError + Send + Sync + 'static>),
}

impl TaskError {
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn failed(source: impl Into<BoxError>) -> Self {
        Self::Failed(Arc::from(source.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<crate::resource::ResourceError> for TaskError {
    fn from(error: crate::resource::ResourceError) -> Self {
        if error.is_cancelled() {
            return Self::cancelled(error.to_string());
        }
        Self::failed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceError;

    #[test]
    fn display_includes_reason() {
        assert_eq!(
            TaskError::cancelled("user navigated away").to_string(),
            "task cancelled: user navigated away"
        );
        assert_eq!(
            TaskError::Timeout {
                after: Duration::from_millis(50)
            }
            .to_string(),
            "task timed out after 50ms"
        );
    }

    #[test]
    fn resource_cancellation_stays_a_cancellation() {
        let error: TaskError = ResourceError::cancelled("users").into();
        assert!(error.is_cancelled());

        let error: TaskError = ResourceError::invalid_key("users", "empty").into();
        assert!(matches!(error, TaskError::Failed(_)));
        assert!(error.source().is_some());
    }
}
