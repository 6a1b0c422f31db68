//! # Scheduler
//!
//! 后台周期任务。目前只有磁盘回收。

pub mod pruning;

pub use pruning::{initial_delay, PruningScheduler};
