//! Worker pool: long-lived worker connections draining the chunk queue.
//!
//! Each worker owns one cloned connection (with the bulk-export token bound
//! in), pulls chunks from the shared [`TaskQueue`](crate::planner::TaskQueue)
//! and spills fetched batches to its own file. Workers never call back into
//! the coordinator; all they hold is the queue handle and their output path.

pub mod manager;
pub mod worker;

pub use manager::{WorkerHandle, WorkerPool};
