// Data model for persisted tasks and their companion types

pub mod task;

pub use task::{
    Lease, Page, QueueCounts, StepResult, StepStatus, Task, TaskFilter, TaskLogEntry, TaskParams,
    TaskType,
};
