//! Postgres-backed task store.
//!
//! The claim uses a single conditional `UPDATE … FROM (SELECT … FOR UPDATE
//! SKIP LOCKED)` statement, so concurrent orchestrator processes race safely
//! at the database rather than through any in-process lock. Checkpoint and
//! finalize run in a short transaction that row-locks the task, validates the
//! lease, and writes. The write never happens when the precondition fails.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{DocflowError, Result};
use crate::models::{
    Lease, Page, QueueCounts, StepResult, Task, TaskFilter, TaskLogEntry, TaskParams, TaskType,
};
use crate::state_machine::{target_status, TaskEvent, TaskStatus};
use crate::store::{StepCheckpoint, TaskOutcome, TaskStore};

/// Advisory lock key serializing claims across orchestrator processes.
///
/// The claim statement's running-count subquery reads a statement snapshot,
/// so two sessions both at `ceiling - 1` running tasks would each pass the
/// ceiling check and promote disjoint candidates. Taking this lock first
/// makes the count check and the promotion one indivisible unit per claimer.
const CLAIM_LOCK_KEY: i64 = 0x646f_6366_6c6f_77;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS docflow_tasks (
    task_id UUID PRIMARY KEY,
    task_type TEXT NOT NULL,
    subject_reference TEXT NOT NULL,
    status TEXT NOT NULL,
    current_step BIGINT NOT NULL DEFAULT 0,
    step_results JSONB NOT NULL DEFAULT '[]'::jsonb,
    params JSONB NOT NULL DEFAULT '{}'::jsonb,
    lease_owner UUID,
    lease_expires_at TIMESTAMPTZ,
    last_error TEXT,
    logs JSONB NOT NULL DEFAULT '[]'::jsonb,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_docflow_tasks_status_created
    ON docflow_tasks (status, created_at);
"#;

/// Row shape for runtime-checked queries
#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: Uuid,
    task_type: String,
    subject_reference: String,
    status: String,
    current_step: i64,
    step_results: serde_json::Value,
    params: serde_json::Value,
    lease_owner: Option<Uuid>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    logs: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DocflowError;

    fn try_from(row: TaskRow) -> Result<Self> {
        let task_type: TaskType = row
            .task_type
            .parse()
            .map_err(DocflowError::StoreError)?;
        let status: TaskStatus = row.status.parse().map_err(DocflowError::StoreError)?;
        let step_results: Vec<StepResult> = serde_json::from_value(row.step_results)
            .map_err(|e| DocflowError::StoreError(format!("corrupt step_results: {e}")))?;
        let logs: Vec<TaskLogEntry> = serde_json::from_value(row.logs)
            .map_err(|e| DocflowError::StoreError(format!("corrupt logs: {e}")))?;
        let params: TaskParams = serde_json::from_value(row.params)
            .map_err(|e| DocflowError::StoreError(format!("corrupt params: {e}")))?;

        let lease = match (row.lease_owner, row.lease_expires_at) {
            (Some(owner_token), Some(expires_at)) => Some(Lease {
                owner_token,
                expires_at,
            }),
            _ => None,
        };

        Ok(Task {
            task_id: row.task_id,
            task_type,
            subject_reference: row.subject_reference,
            status,
            current_step: row.current_step as usize,
            step_results,
            params,
            lease,
            last_error: row.last_error,
            logs,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the task table and indexes if missing
    pub async fn migrate(&self) -> Result<()> {
        let mut tx = self.begin().await?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| DocflowError::StoreError(format!("migration failed: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| DocflowError::StoreError(format!("migration commit failed: {e}")))?;
        info!("📦 STORE: docflow_tasks schema ensured");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| DocflowError::StoreError(format!("failed to begin transaction: {e}")))
    }

    /// Row-lock a task inside `tx` and validate the caller's lease
    async fn lock_leased_task(
        tx: &mut Transaction<'_, Postgres>,
        task_id: Uuid,
        owner_token: Uuid,
    ) -> Result<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as("SELECT * FROM docflow_tasks WHERE task_id = $1 FOR UPDATE")
                .bind(task_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| DocflowError::StoreError(format!("task lookup failed: {e}")))?;

        let task: Task = row
            .ok_or_else(|| DocflowError::TaskNotFound(task_id.to_string()))?
            .try_into()?;

        match task.lease {
            Some(lease) if lease.owner_token == owner_token && !lease.is_expired_at(Utc::now()) => {
                Ok(task)
            }
            Some(lease) if lease.owner_token == owner_token => Err(DocflowError::LeaseConflict(
                format!("lease for task {task_id} expired at {}", lease.expires_at),
            )),
            _ => Err(DocflowError::LeaseConflict(format!(
                "task {task_id} is not leased to worker {owner_token}"
            ))),
        }
    }

    async fn write_task(tx: &mut Transaction<'_, Postgres>, task: &Task) -> Result<()> {
        let step_results = serde_json::to_value(&task.step_results)
            .map_err(|e| DocflowError::StoreError(format!("serialize step_results: {e}")))?;
        let logs = serde_json::to_value(&task.logs)
            .map_err(|e| DocflowError::StoreError(format!("serialize logs: {e}")))?;

        sqlx::query(
            r#"
            UPDATE docflow_tasks
            SET status = $2,
                current_step = $3,
                step_results = $4,
                lease_owner = $5,
                lease_expires_at = $6,
                last_error = $7,
                logs = $8,
                updated_at = $9
            WHERE task_id = $1
            "#,
        )
        .bind(task.task_id)
        .bind(task.status.to_string())
        .bind(task.current_step as i64)
        .bind(step_results)
        .bind(task.lease.map(|l| l.owner_token))
        .bind(task.lease.map(|l| l.expires_at))
        .bind(&task.last_error)
        .bind(logs)
        .bind(task.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| DocflowError::StoreError(format!("task update failed: {e}")))?;

        Ok(())
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
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert_task(&self, task: Task) -> Result<()> {
        let step_results = serde_json::to_value(&task.step_results)
            .map_err(|e| DocflowError::StoreError(format!("serialize step_results: {e}")))?;
        let logs = serde_json::to_value(&task.logs)
            .map_err(|e| DocflowError::StoreError(format!("serialize logs: {e}")))?;
        let params = serde_json::to_value(&task.params)
            .map_err(|e| DocflowError::StoreError(format!("serialize params: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO docflow_tasks
                (task_id, task_type, subject_reference, status, current_step,
                 step_results, params, last_error, logs, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(task.task_id)
        .bind(task.task_type.to_string())
        .bind(&task.subject_reference)
        .bind(task.status.to_string())
        .bind(task.current_step as i64)
        .bind(step_results)
        .bind(params)
        .bind(&task.last_error)
        .bind(logs)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| DocflowError::StoreError(format!("task insert failed: {e}")))?;

        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as("SELECT * FROM docflow_tasks WHERE task_id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| DocflowError::StoreError(format!("task lookup failed: {e}")))?;

        row.map(Task::try_from).transpose()
    }

    async fn list_tasks(&self, filter: TaskFilter, page: Page) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT * FROM docflow_tasks
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(filter.status.map(|s| s.to_string()))
        .bind(page.per_page as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DocflowError::StoreError(format!("task listing failed: {e}")))?;

        rows.into_iter().map(Task::try_from).collect()
    }

    async fn claim_next(&self, max_running: usize, lease_ttl: Duration) -> Result<Option<Task>> {
        let owner_token = Uuid::new_v4();
        let claim_log = serde_json::to_value(vec![TaskLogEntry::info(format!(
            "Claimed under lease {owner_token}"
        ))])
        .map_err(|e| DocflowError::StoreError(format!("serialize log: {e}")))?;

        let mut tx = self.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CLAIM_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| DocflowError::StoreError(format!("claim serialization failed: {e}")))?;

        // With claims serialized, the ceiling subquery and the promotion are
        // atomic; SKIP LOCKED still guards against rows locked by checkpoint
        // or finalize transactions.
        let row: Option<TaskRow> = sqlx::query_as(
            r#"
            WITH candidate AS (
                SELECT task_id FROM docflow_tasks
                WHERE (status IN ('pending', 'queued')
                       OR (status = 'step_failed' AND task_type = 'full_pipeline'))
                  AND (SELECT COUNT(*) FROM docflow_tasks WHERE status = 'running') < $1
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE docflow_tasks t
            SET status = 'running',
                lease_owner = $2,
                lease_expires_at = NOW() + make_interval(secs => $3),
                updated_at = NOW(),
                logs = t.logs || $4::jsonb
            FROM candidate c
            WHERE t.task_id = c.task_id
            RETURNING t.*
            "#,
        )
        .bind(max_running as i64)
        .bind(owner_token)
        .bind(lease_ttl.as_secs_f64())
        .bind(claim_log)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to claim next task: {}", e);
            DocflowError::StoreError(format!("task claim failed: {e}"))
        })?;

        tx.commit()
            .await
            .map_err(|e| DocflowError::StoreError(format!("claim commit failed: {e}")))?;

        match row {
            Some(row) => {
                let task: Task = row.try_into()?;
                debug!(
                    task_id = %task.task_id,
                    task_type = %task.task_type,
                    current_step = task.current_step,
                    "Claimed task"
                );
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn checkpoint_step(
        &self,
        checkpoint: StepCheckpoint,
        lease_extension: Duration,
    ) -> Result<Task> {
        let mut tx = self.begin().await?;
        let mut task =
            Self::lock_leased_task(&mut tx, checkpoint.task_id, checkpoint.owner_token).await?;

        if task.status != TaskStatus::Running {
            return Err(DocflowError::StateTransitionError(format!(
                "cannot checkpoint task {} in status {}",
                task.task_id, task.status
            )));
        }
        if checkpoint.step_index != task.current_step {
            return Err(DocflowError::StateTransitionError(format!(
                "checkpoint for step {} but task {} is at step {}",
                checkpoint.step_index, task.task_id, task.current_step
            )));
        }

        let now = Utc::now();
        let step_name = checkpoint.result.step_name.clone();
        Self::upsert_step_result(&mut task, checkpoint.result);
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

        Self::write_task(&mut tx, &task).await?;
        tx.commit()
            .await
            .map_err(|e| DocflowError::StoreError(format!("checkpoint commit failed: {e}")))?;

        Ok(task)
    }

    async fn finalize_task(
        &self,
        task_id: Uuid,
        owner_token: Uuid,
        outcome: TaskOutcome,
    ) -> Result<Task> {
        let mut tx = self.begin().await?;
        let mut task = Self::lock_leased_task(&mut tx, task_id, owner_token).await?;

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
                Self::upsert_step_result(&mut task, result);
            }
            TaskOutcome::Failed { result, error } => {
                task.last_error = Some(error.clone());
                task.logs
                    .push(TaskLogEntry::error(format!("Task failed: {error}")));
                if let Some(result) = result {
                    Self::upsert_step_result(&mut task, result);
                }
            }
        }

        task.lease = None;
        task.updated_at = Utc::now();

        Self::write_task(&mut tx, &task).await?;
        tx.commit()
            .await
            .map_err(|e| DocflowError::StoreError(format!("finalize commit failed: {e}")))?;

        Ok(task)
    }

    async fn requeue_expired(&self) -> Result<Vec<Uuid>> {
        let recovery_log = serde_json::to_value(vec![TaskLogEntry::info(
            "Lease expired; re-admitted to the queue by recovery",
        )])
        .map_err(|e| DocflowError::StoreError(format!("serialize log: {e}")))?;

        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE docflow_tasks
            SET status = 'queued',
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW(),
                logs = logs || $1::jsonb
            WHERE status = 'running' AND lease_expires_at <= NOW()
            RETURNING task_id
            "#,
        )
        .bind(recovery_log)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DocflowError::StoreError(format!("lease recovery failed: {e}")))?;

        Ok(rows.into_iter().map(|(task_id,)| task_id).collect())
    }

    async fn requeue_task(&self, task_id: Uuid) -> Result<bool> {
        let requeue_log = serde_json::to_value(vec![TaskLogEntry::info(
            "Manually re-admitted to the queue",
        )])
        .map_err(|e| DocflowError::StoreError(format!("serialize log: {e}")))?;

        let updated = sqlx::query(
            r#"
            UPDATE docflow_tasks
            SET status = 'queued', updated_at = NOW(), logs = logs || $2::jsonb
            WHERE task_id = $1 AND status = 'pending'
            "#,
        )
        .bind(task_id)
        .bind(requeue_log)
        .execute(&self.pool)
        .await
        .map_err(|e| DocflowError::StoreError(format!("manual requeue failed: {e}")))?;

        if updated.rows_affected() > 0 {
            return Ok(true);
        }

        // Already queued counts as success; anything else does not.
        match self.get_task(task_id).await? {
            Some(task) => Ok(task.status == TaskStatus::Queued),
            None => Err(DocflowError::TaskNotFound(task_id.to_string())),
        }
    }

    async fn append_task_log(&self, task_id: Uuid, entry: TaskLogEntry) -> Result<()> {
        let log = serde_json::to_value(vec![entry])
            .map_err(|e| DocflowError::StoreError(format!("serialize log: {e}")))?;

        let updated = sqlx::query(
            "UPDATE docflow_tasks SET logs = logs || $2::jsonb, updated_at = NOW() WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(log)
        .execute(&self.pool)
        .await
        .map_err(|e| DocflowError::StoreError(format!("log append failed: {e}")))?;

        if updated.rows_affected() == 0 {
            return Err(DocflowError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    async fn queue_counts(&self) -> Result<QueueCounts> {
        let (running, queued): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'running'),
                COUNT(*) FILTER (WHERE status IN ('pending', 'queued')
                                 OR (status = 'step_failed' AND task_type = 'full_pipeline'))
            FROM docflow_tasks
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DocflowError::StoreError(format!("queue counts failed: {e}")))?;

        Ok(QueueCounts {
            running: running as usize,
            queued: queued as usize,
        })
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM docflow_tasks WHERE status IN ('succeeded', 'failed') AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| DocflowError::StoreError(format!("retention purge failed: {e}")))?;

        Ok(deleted.rows_affected())
    }
}
