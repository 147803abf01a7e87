//! Cooperative task model.
//!
//! [`Task`] wraps spawned async work with an explicit cancel operation and a
//! shareable outcome; [`while_task`] polls until a condition holds; and
//! [`TaskScheduler`] serializes tasks that touch the same id.

mod error;
mod handle;
mod scheduler;
mod while_task;

pub use error::TaskError;
pub use handle::{Task, TaskControl};
pub use scheduler::{DEFAULT_PRIORITY, TaskScheduler};
pub use while_task::while_task;
