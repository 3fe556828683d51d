//! Task executor
//!
//! The bounded worker pool every grading job runs on. Nothing else in the
//! runner executes jobs directly: callers build a [`QueueEntry`] and hand it
//! to [`TaskExecutor::submit`].

mod entry;
mod pool;

pub use entry::{QueueEntry, WorkFuture};
pub use pool::{ExecutorConfig, TaskExecutor};
