//! Task claiming, execution, and background loops.

pub mod core;
pub mod task_manager;
pub mod worker;

pub use core::Orchestrator;
pub use task_manager::{QueueStats, TaskManager};
pub use worker::WorkerPool;
