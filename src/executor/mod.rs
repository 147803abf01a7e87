//! Event/executor pipeline.
//!
//! Resources publish their change notifications through [`Executor`]s, and
//! cross-resource wiring is expressed as handlers and links between them. A
//! view layer subscribes to the same executors; nothing here depends on a
//! particular reactivity runtime.

mod context;
mod pipeline;

pub use context::{ExecutionContext, ExecutorInterrupter};
pub use pipeline::{Executor, HandlerId};
