//! Key-addressed resource caching with deduplicated loads, dependency
//! invalidation, executor pipelines and cancellable tasks.

pub mod config;
pub mod executor;
pub(crate) mod lock;
pub mod resource;
pub mod task;
pub mod telemetry;
pub mod util;
