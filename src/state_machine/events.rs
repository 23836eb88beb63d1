use serde::{Deserialize, Serialize};

/// Events that drive task status transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event", content = "data")]
pub enum TaskEvent {
    /// Re-admit an eligible task to the queue (recovery, resume, manual kick)
    Enqueue,
    /// A worker claims the task under a fresh lease
    Claim,
    /// All steps finished successfully
    Complete,
    /// A step failed but the task may be resumed later
    FailStep(String),
    /// Terminal failure
    Fail(String),
}
