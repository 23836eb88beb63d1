//! In-memory task store.
//!
//! Every conditional update runs inside a single mutex scope, which gives the
//! same claim/checkpoint atomicity the Postgres store gets from conditional
//! SQL. No await happens while the lock is held.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DocflowError, Result};
use crate::models::{Lease, Page, QueueCounts, StepResult, Task, TaskFilter, TaskLogEntry};
use crate::state_machine::{target_status, TaskEvent, TaskStatus};
use crate::store::{StepCheckpoint, TaskOutcome, TaskStore};

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<Uuid, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn upsert_step_result(task: &mut Task, result: StepResult) {
        match task
            .step_results
            .iter_mut()
            .find(|existing| existing.step_name == result.step_name)
        {
            Some(existing) => *existing = result,
            None => task.step_results.push(result),
        }
    }

    /// Validate the caller's lease against the stored one. A missing,
    /// mismatched or expired lease is a conflict: the caller is a stale
    /// worker whose task has been re-admitted or finished by someone else.
    fn check_lease(task: &Task, owner_token: Uuid, now: DateTime<Utc>) -> Result<()> {
        match task.lease {
            Some(lease) if lease.owner_token == owner_token && !lease.is_expired_at(now) => Ok(()),
            Some(lease) if lease.owner_token == owner_token => Err(DocflowError::LeaseConflict(
                format!("lease for task {} expired at {}", task.task_id, lease.expires_at),
            )),
            _ => Err(DocflowError::LeaseConflict(format!(
                "task {} is not leased to worker {owner_token}",
                task.task_id
            ))),
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_task(&self, task: Task) -> Result<()> {
        self.tasks.lock().insert(task.task_id, task);
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.tasks.lock().get(&task_id).cloned())
    }

    async fn list_tasks(&self, filter: TaskFilter, page: Page) -> Result<Vec<Task>> {
        let tasks = self.tasks.lock();
        let mut matching: Vec<&Task> = tasks
            .values()
            .filter(|task| filter.status.map_or(true, |status| task.status == status))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(matching
            .into_iter()
            .skip(page.offset())
            .take(page.per_page)
            .cloned()
            .collect())
    }

    async fn claim_next(&self, max_running: usize, lease_ttl: Duration) -> Result<Option<Task>> {
        let mut tasks = self.tasks.lock();

        let running = tasks
            .values()
            .filter(|task| task.status == TaskStatus::Running)
            .count();
        if running >= max_running {
            debug!(running, max_running, "Concurrency ceiling reached, claiming nothing");
            return Ok(None);
        }

        // Oldest eligible first: best-effort FIFO by creation time.
        let candidate = tasks
            .values()
            .filter(|task| task.status.is_claimable(task.task_type))
            .min_by_key(|task| (task.created_at, task.task_id))
            .map(|task| task.task_id);

        let Some(task_id) = candidate else {
            return Ok(None);
        };

        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| DocflowError::TaskNotFound(task_id.to_string()))?;

        let resuming = task.status == TaskStatus::StepFailed;
        if task.status != TaskStatus::Queued {
            task.status = target_status(task.status, &TaskEvent::Enqueue, task.task_type)?;
        }
        task.status = target_status(task.status, &TaskEvent::Claim, task.task_type)?;

        let lease = Lease::new(lease_ttl);
        task.lease = Some(lease);
        task.updated_at = Utc::now();
        task.logs.push(TaskLogEntry::info(if resuming {
            format!(
                "Resumed at step {} under lease {}",
                task.current_step, lease.owner_token
            )
        } else {
            format!("Claimed under lease {}", lease.owner_token)
        }));

        Ok(Some(task.clone()))
    }

    async fn checkpoint_step(
        &self,
        checkpoint: StepCheckpoint,
        lease_extension: Duration,
    ) -> Result<Task> {
        let mut tasks = self.tasks.lock();
        let now = Utc::now();

        let task = tasks
            .get_mut(&checkpoint.task_id)
            .ok_or_else(|| DocflowError::TaskNotFound(checkpoint.task_id.to_string()))?;

        Self::check_lease(task, checkpoint.owner_token, now)?;

        if task.status != TaskStatus::Running {
            return Err(DocflowError::StateTransitionError(format!(
                "cannot checkpoint task {} in status {}",
                task.task_id, task.status
            )));
        }

        // current_step never decreases: only the step at the cursor may be
        // checkpointed, and the cursor only moves forward past it.
        if checkpoint.step_index != task.current_step {
            return Err(DocflowError::StateTransitionError(format!(
                "checkpoint for step {} but task {} is at step {}",
                checkpoint.step_index, task.task_id, task.current_step
            )));
        }

        let step_name = checkpoint.result.step_name.clone();
        Self::upsert_step_result(task, checkpoint.result);
        task.current_step = checkpoint.step_index + 1;
        if let Some(lease) = task.lease.as_mut() {
            lease.expires_at = now
                + chrono::Duration::from_std(lease_extension)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
        }
        task.updated_at = now;
        task.logs.push(TaskLogEntry::info(format!(
            "Step '{step_name}' completed; checkpointed at step {}",
            task.current_step
        )));

        Ok(task.clone())
    }

    async fn finalize_task(
        &self,
        task_id: Uuid,
        owner_token: Uuid,
        outcome: TaskOutcome,
    ) -> Result<Task> {
        let mut tasks = self.tasks.lock();
        let now = Utc::now();

        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| DocflowError::TaskNotFound(task_id.to_string()))?;

        Self::check_lease(task, owner_token, now)?;

        let event = match &outcome {
            TaskOutcome::Succeeded => TaskEvent::Complete,
            TaskOutcome::StepFailed { result } => TaskEvent::FailStep(
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| "step failed".to_string()),
            ),
            TaskOutcome::Failed { error, .. } => TaskEvent::Fail(error.clone()),
        };
        task.status = target_status(task.status, &event, task.task_type)?;

        match outcome {
            TaskOutcome::Succeeded => {
                task.last_error = None;
                task.logs.push(TaskLogEntry::info("Task succeeded"));
            }
            TaskOutcome::StepFailed { result } => {
                task.last_error = result.error.clone();
                task.logs.push(TaskLogEntry::error(format!(
                    "Step '{}' failed (attempt {}); task is resumable",
                    result.step_name, result.attempts
                )));
                Self::upsert_step_result(task, result);
            }
            TaskOutcome::Failed { result, error } => {
                task.last_error = Some(error.clone());
                task.logs
                    .push(TaskLogEntry::error(format!("Task failed: {error}")));
                if let Some(result) = result {
                    Self::upsert_step_result(task, result);
                }
            }
        }

        task.lease = None;
        task.updated_at = now;

        Ok(task.clone())
    }

    async fn requeue_expired(&self) -> Result<Vec<Uuid>> {
        let mut tasks = self.tasks.lock();
        let now = Utc::now();
        let mut requeued = Vec::new();

        for task in tasks.values_mut() {
            let expired = task.status == TaskStatus::Running
                && task
                    .lease
                    .map(|lease| lease.is_expired_at(now))
                    .unwrap_or(true);
            if !expired {
                continue;
            }

            task.status = target_status(task.status, &TaskEvent::Enqueue, task.task_type)?;
            task.lease = None;
            task.updated_at = now;
            task.logs.push(TaskLogEntry::info(
                "Lease expired; re-admitted to the queue by recovery",
            ));
            requeued.push(task.task_id);
        }

        Ok(requeued)
    }

    async fn requeue_task(&self, task_id: Uuid) -> Result<bool> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| DocflowError::TaskNotFound(task_id.to_string()))?;

        match task.status {
            TaskStatus::Queued => Ok(true),
            TaskStatus::Pending => {
                task.status = target_status(task.status, &TaskEvent::Enqueue, task.task_type)?;
                task.updated_at = Utc::now();
                task.logs
                    .push(TaskLogEntry::info("Manually re-admitted to the queue"));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_task_log(&self, task_id: Uuid, entry: TaskLogEntry) -> Result<()> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| DocflowError::TaskNotFound(task_id.to_string()))?;
        task.logs.push(entry);
        Ok(())
    }

    async fn queue_counts(&self) -> Result<QueueCounts> {
        let tasks = self.tasks.lock();
        let mut counts = QueueCounts::default();
        for task in tasks.values() {
            if task.status == TaskStatus::Running {
                counts.running += 1;
            } else if task.status.is_claimable(task.task_type) {
                counts.queued += 1;
            }
        }
        Ok(counts)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, task| !(task.status.is_terminal() && task.created_at < cutoff));
        Ok((before - tasks.len()) as u64)
    }
}
