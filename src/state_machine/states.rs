use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::TaskType;

/// Task status definitions for the pipeline state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Initial status when the task is created by a producer
    Pending,
    /// Eligible for claiming (re-admitted by recovery, manual kick, or resume)
    Queued,
    /// Claimed by exactly one worker under an active lease
    Running,
    /// A step failed but the task can be resumed (full-pipeline only)
    StepFailed,
    /// All steps completed
    Succeeded,
    /// Terminal failure
    Failed,
}

impl TaskStatus {
    /// Check if this is a terminal status (no further writes allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Check if a task in this status can be claimed by a worker.
    ///
    /// `step_failed` is claimable only for full-pipeline tasks; a
    /// regenerate-step task never re-enters the queue after a failure.
    pub fn is_claimable(&self, task_type: TaskType) -> bool {
        match self {
            Self::Pending | Self::Queued => true,
            Self::StepFailed => task_type == TaskType::FullPipeline,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::StepFailed => write!(f, "step_failed"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "step_failed" => Ok(Self::StepFailed),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}
