//! Persisted task record and its companion types.
//!
//! One record per task: status, per-step results, the active lease while
//! running, and an append-only human-readable event log for audit and
//! debugging. The store is the single source of truth for these records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::state_machine::TaskStatus;

/// The two task flavors the orchestrator runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// The full multi-step pipeline for a subject, resumable on step failure
    FullPipeline,
    /// Re-run a single named step; any failure is terminal
    RegenerateStep,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullPipeline => write!(f, "full_pipeline"),
            Self::RegenerateStep => write!(f, "regenerate_step"),
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_pipeline" => Ok(Self::FullPipeline),
            "regenerate_step" => Ok(Self::RegenerateStep),
            _ => Err(format!("Invalid task type: {s}")),
        }
    }
}

/// Outcome of one recorded step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

/// Persisted checkpoint for one pipeline step.
///
/// `attempts` counts every invocation of the step across resumes; `output`
/// carries the step's result forward as input context for later steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
    pub attempts: u32,
    pub output: Option<serde_json::Value>,
}

/// Time-bounded claim a worker holds on a running task
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub owner_token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            owner_token: Uuid::new_v4(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30)),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Append-only, timestamped task log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

impl TaskLogEntry {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: "INFO".to_string(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: "ERROR".to_string(),
            message: message.into(),
        }
    }
}

/// Caller-supplied task parameters.
///
/// For regenerate-step tasks `target_step` names the single step to run and
/// `instruction_override` optionally replaces that step's instruction for
/// this task only and is never written back into shared configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_override: Option<String>,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// One persisted record per orchestrated task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub task_type: TaskType,
    /// Opaque id of the content being processed
    pub subject_reference: String,
    pub status: TaskStatus,
    /// Index of the next step to run; never decreases
    pub current_step: usize,
    pub step_results: Vec<StepResult>,
    pub params: TaskParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub logs: Vec<TaskLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: TaskType, subject_reference: impl Into<String>, params: TaskParams) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            task_type,
            subject_reference: subject_reference.into(),
            status: TaskStatus::Pending,
            current_step: 0,
            step_results: Vec::new(),
            params,
            lease: None,
            last_error: None,
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Previously recorded attempts for a step, by name
    pub fn step_attempts(&self, step_name: &str) -> u32 {
        self.step_results
            .iter()
            .filter(|r| r.step_name == step_name)
            .map(|r| r.attempts)
            .max()
            .unwrap_or(0)
    }

    /// Successful step outputs keyed by step name, for downstream context
    pub fn accumulated_outputs(&self) -> serde_json::Map<String, serde_json::Value> {
        self.step_results
            .iter()
            .filter(|r| r.status == StepStatus::Succeeded)
            .filter_map(|r| {
                r.output
                    .clone()
                    .map(|output| (r.step_name.clone(), output))
            })
            .collect()
    }

    /// Clone with the log truncated to its tail, for list views
    pub fn with_log_tail(mut self, keep: usize) -> Self {
        if self.logs.len() > keep {
            self.logs = self.logs.split_off(self.logs.len() - keep);
        }
        self
    }
}

/// Producer-facing listing filter
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
}

/// Pagination for task listings, ordered by creation time descending
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: usize,
    pub per_page: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 0,
            per_page: 50,
        }
    }
}

impl Page {
    pub fn offset(&self) -> usize {
        self.page * self.per_page
    }
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Tasks currently running under an unexpired lease
    pub running: usize,
    /// Tasks eligible for claiming
    pub queued: usize,
}
