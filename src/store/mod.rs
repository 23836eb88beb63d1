//! # Task Store Port
//!
//! ## Architecture: Atomic Conditional Updates
//!
//! The task store is the single source of truth for task state, and the only
//! synchronization point in the system. Every state-changing operation here
//! is an atomic conditional update: claim, checkpoint, and finalize carry
//! their preconditions (status, lease token, step index) into the store and
//! fail or no-op when the precondition no longer holds. Workers never hold an
//! in-process lock across step execution, so multiple orchestrator instances
//! can safely share one store.
//!
//! Two implementations:
//!
//! - [`memory::InMemoryTaskStore`]: conditional updates inside a single
//!   mutex scope; used by tests and embedded deployments.
//! - `postgres::PgTaskStore`: conditional SQL statements with
//!   `FOR UPDATE SKIP LOCKED` claiming (feature `postgres`, on by default).

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Page, QueueCounts, StepResult, Task, TaskFilter, TaskLogEntry};

pub use memory::InMemoryTaskStore;
#[cfg(feature = "postgres")]
pub use postgres::PgTaskStore;

/// A completed step waiting to be persisted, conditional on the lease.
///
/// `step_index` must equal the task's `current_step`; the store advances
/// `current_step` past it in the same update, which is what makes the index
/// monotonically non-decreasing and makes a crash between steps lose no
/// completed work.
#[derive(Debug, Clone)]
pub struct StepCheckpoint {
    pub task_id: Uuid,
    pub owner_token: Uuid,
    pub step_index: usize,
    pub result: StepResult,
}

/// Terminal or resumable outcome of an execution pass
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Succeeded,
    /// Resumable step failure (full-pipeline tasks only)
    StepFailed { result: StepResult },
    /// Terminal failure; the step result is absent when the task never
    /// reached a step (e.g. an unknown regen target)
    Failed {
        result: Option<StepResult>,
        error: String,
    },
}

/// Durable record store for tasks.
///
/// Implementations must make `claim_next`, `checkpoint_step` and
/// `finalize_task` atomic with respect to concurrent callers.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a freshly created task in `pending`
    async fn insert_task(&self, task: Task) -> Result<()>;

    /// Fetch one task with its full status, step results and log
    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>>;

    /// List tasks ordered by creation time descending
    async fn list_tasks(&self, filter: TaskFilter, page: Page) -> Result<Vec<Task>>;

    /// Atomically claim the oldest eligible task while fewer than
    /// `max_running` tasks are running. Returns `None` when nothing is
    /// eligible or the ceiling is reached; both are normal, not errors.
    async fn claim_next(&self, max_running: usize, lease_ttl: Duration) -> Result<Option<Task>>;

    /// Persist a completed step and advance `current_step`, renewing the
    /// lease by `lease_extension`. Rejected with `LeaseConflict` when the
    /// lease token is stale or expired.
    async fn checkpoint_step(
        &self,
        checkpoint: StepCheckpoint,
        lease_extension: Duration,
    ) -> Result<Task>;

    /// Transition a running task to its outcome status and release the
    /// lease. Rejected with `LeaseConflict` when the token is stale.
    async fn finalize_task(
        &self,
        task_id: Uuid,
        owner_token: Uuid,
        outcome: TaskOutcome,
    ) -> Result<Task>;

    /// Re-admit every running task whose lease has expired (presumed crashed
    /// worker). Returns the re-admitted task ids.
    async fn requeue_expired(&self) -> Result<Vec<Uuid>>;

    /// Manually re-admit a stalled pending task. Returns whether the task is
    /// now queued.
    async fn requeue_task(&self, task_id: Uuid) -> Result<bool>;

    /// Append one entry to a task's audit log
    async fn append_task_log(&self, task_id: Uuid, entry: TaskLogEntry) -> Result<()>;

    /// Occupancy snapshot for the operational surface
    async fn queue_counts(&self) -> Result<QueueCounts>;

    /// Delete terminal tasks created before `cutoff`; returns how many
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
