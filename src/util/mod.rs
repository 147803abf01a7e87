//! Small data-structure helpers shared by the resource and task modules.

pub mod priority_queue;

pub use priority_queue::PriorityQueue;
