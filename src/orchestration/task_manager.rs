//! Task lifecycle coordination.
//!
//! The manager owns the producer surface (create, kick, inspect) and the
//! consumer surface (claim, execute). Execution is checkpoint-per-step: every
//! completed step is persisted before the next one starts, so a crashed
//! worker costs at most the step that was in flight when it died.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{DocflowError, Result};
use crate::logging::{log_step_operation, log_task_operation};
use crate::models::{
    Page, StepResult, StepStatus, Task, TaskFilter, TaskLogEntry, TaskParams, TaskType,
};
use crate::pipeline::{PipelineRegistry, StepContext, StepError, StepExecutor};
use crate::store::{StepCheckpoint, TaskOutcome, TaskStore};

/// How many trailing log entries task listings carry
const LIST_LOG_TAIL: usize = 10;

/// Queue occupancy relative to the configured ceiling
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QueueStats {
    pub running: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    registry: Arc<PipelineRegistry>,
    config: OrchestratorConfig,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<PipelineRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Validate and persist a new task in `PENDING` state
    #[instrument(skip(self, params), fields(task_type = %task_type))]
    pub async fn create_task(
        &self,
        task_type: TaskType,
        subject_reference: &str,
        params: TaskParams,
    ) -> Result<Task> {
        if subject_reference.is_empty() {
            return Err(DocflowError::ValidationError(
                "subject_reference must not be empty".to_string(),
            ));
        }

        match task_type {
            TaskType::RegenerateStep => {
                let target = params.target_step.as_deref().ok_or_else(|| {
                    DocflowError::ValidationError(
                        "regenerate_step tasks require a target_step".to_string(),
                    )
                })?;
                self.registry.ensure_known_step(target)?;
            }
            TaskType::FullPipeline => {
                if params.target_step.is_some() {
                    return Err(DocflowError::ValidationError(
                        "full_pipeline tasks must not name a target_step".to_string(),
                    ));
                }
            }
        }

        let mut task = Task::new(task_type, subject_reference, params);
        task.logs.push(TaskLogEntry::info(format!(
            "Task created for subject '{}'",
            task.subject_reference
        )));

        self.store.insert_task(task.clone()).await?;
        log_task_operation(
            "create_task",
            Some(task.task_id),
            Some(&task.task_type.to_string()),
            "created",
            Some(&format!("subject={}", task.subject_reference)),
        );
        Ok(task)
    }

    /// Claim the oldest eligible task, respecting the concurrency ceiling
    pub async fn claim_next(&self) -> Result<Option<Task>> {
        self.store
            .claim_next(self.config.max_concurrent_tasks, self.config.lease_duration)
            .await
    }

    /// Run a claimed task to an outcome.
    ///
    /// The task must hold a live lease from [`claim_next`](Self::claim_next).
    /// Each successful step is checkpointed (which also renews the lease)
    /// before the next step runs. Step failures never propagate as `Err`;
    /// they become a persisted `STEP_FAILED` or `FAILED` outcome. `Err` means
    /// the store refused a write, typically a lost lease.
    #[instrument(skip(self, task), fields(task_id = %task.task_id, task_type = %task.task_type))]
    pub async fn execute(&self, mut task: Task) -> Result<Task> {
        let owner_token = task
            .lease
            .map(|lease| lease.owner_token)
            .ok_or_else(|| {
                DocflowError::OrchestrationError(format!(
                    "task {} has no lease; claim it before executing",
                    task.task_id
                ))
            })?;

        // A task with no runnable plan (e.g. a regen target that left the
        // pipeline) fails terminally instead of squatting on its lease
        let plan = match self.execution_plan(&task) {
            Ok(plan) => plan,
            Err(e) => {
                return self
                    .store
                    .finalize_task(
                        task.task_id,
                        owner_token,
                        TaskOutcome::Failed {
                            result: None,
                            error: e.to_string(),
                        },
                    )
                    .await;
            }
        };
        debug!(
            task_id = %task.task_id,
            steps = plan.len(),
            from_step = task.current_step,
            "Starting execution"
        );

        for step in plan {
            let step_name = step.name().to_string();
            let attempt = task.step_attempts(&step_name) + 1;
            let context = StepContext {
                task_id: task.task_id,
                subject_reference: task.subject_reference.clone(),
                attempt,
                prior_outputs: task.accumulated_outputs(),
                instruction_override: match task.task_type {
                    TaskType::RegenerateStep => task.params.instruction_override.clone(),
                    TaskType::FullPipeline => None,
                },
                params: task.params.context.clone(),
            };

            log_step_operation(
                "execute_step",
                Some(task.task_id),
                Some(&step_name),
                "started",
                Some(&format!("attempt={attempt}")),
            );

            let started_at = Utc::now();
            match step.execute(&context).await {
                Ok(output) => {
                    let result = StepResult {
                        step_name: step_name.clone(),
                        status: StepStatus::Succeeded,
                        started_at,
                        finished_at: Utc::now(),
                        error: None,
                        attempts: attempt,
                        output: Some(output),
                    };
                    task = self
                        .store
                        .checkpoint_step(
                            StepCheckpoint {
                                task_id: task.task_id,
                                owner_token,
                                step_index: task.current_step,
                                result,
                            },
                            self.config.lease_duration,
                        )
                        .await?;
                    log_step_operation(
                        "execute_step",
                        Some(task.task_id),
                        Some(&step_name),
                        "succeeded",
                        None,
                    );
                }
                Err(step_error) => {
                    let message = step_error.to_string();
                    let result = StepResult {
                        step_name: step_name.clone(),
                        status: StepStatus::Failed,
                        started_at,
                        finished_at: Utc::now(),
                        error: Some(message.clone()),
                        attempts: attempt,
                        output: None,
                    };
                    log_step_operation(
                        "execute_step",
                        Some(task.task_id),
                        Some(&step_name),
                        "failed",
                        Some(&message),
                    );

                    let outcome = self.failure_outcome(&task, step_error, result, attempt);
                    return self
                        .store
                        .finalize_task(task.task_id, owner_token, outcome)
                        .await;
                }
            }
        }

        let task = self
            .store
            .finalize_task(task.task_id, owner_token, TaskOutcome::Succeeded)
            .await?;
        log_task_operation(
            "execute",
            Some(task.task_id),
            Some(&task.task_type.to_string()),
            "succeeded",
            None,
        );
        Ok(task)
    }

    /// Steps still owed to this task, in pipeline order
    fn execution_plan(&self, task: &Task) -> Result<Vec<Arc<dyn StepExecutor>>> {
        match task.task_type {
            TaskType::FullPipeline => {
                Ok(self.registry.steps()[task.current_step.min(self.registry.len())..].to_vec())
            }
            TaskType::RegenerateStep => {
                let target = task.params.target_step.as_deref().ok_or_else(|| {
                    DocflowError::OrchestrationError(format!(
                        "regenerate_step task {} has no target_step",
                        task.task_id
                    ))
                })?;
                let step = self.registry.get(target).ok_or_else(|| {
                    DocflowError::OrchestrationError(format!(
                        "regenerate_step task {} targets unknown step '{target}'",
                        task.task_id
                    ))
                })?;
                Ok(vec![step])
            }
        }
    }

    /// Map a step failure to its task-level outcome
    fn failure_outcome(
        &self,
        task: &Task,
        step_error: StepError,
        result: StepResult,
        attempt: u32,
    ) -> TaskOutcome {
        let resumable = task.task_type == TaskType::FullPipeline
            && step_error.is_transient()
            && attempt < self.config.max_step_attempts;
        let error = result
            .error
            .clone()
            .unwrap_or_else(|| "step failed".to_string());

        if resumable {
            TaskOutcome::StepFailed { result }
        } else {
            if task.task_type == TaskType::FullPipeline && step_error.is_transient() {
                warn!(
                    task_id = %task.task_id,
                    step = %result.step_name,
                    attempts = attempt,
                    "Step exhausted its attempt budget, failing task"
                );
            }
            TaskOutcome::Failed {
                result: Some(result),
                error,
            }
        }
    }

    /// Re-admit tasks whose worker lease expired without an outcome
    pub async fn recover_pending(&self) -> Result<Vec<Uuid>> {
        let recovered = self.store.requeue_expired().await?;
        for task_id in &recovered {
            log_task_operation(
                "recover_pending",
                Some(*task_id),
                None,
                "requeued",
                Some("lease expired"),
            );
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered tasks with expired leases");
        }
        Ok(recovered)
    }

    /// Manually re-admit a task to the queue. Returns whether the task is
    /// now queued.
    pub async fn kick_task(&self, task_id: Uuid) -> Result<bool> {
        let requeued = self.store.requeue_task(task_id).await?;
        log_task_operation(
            "kick_task",
            Some(task_id),
            None,
            if requeued { "requeued" } else { "refused" },
            None,
        );
        Ok(requeued)
    }

    /// Cancellation is not supported: an in-flight task cannot be stopped
    /// without leaving partial side effects behind, so the request is
    /// refused rather than half-honored. Always returns `false` for an
    /// existing task.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DocflowError::TaskNotFound(task_id.to_string()))?;
        warn!(
            task_id = %task_id,
            status = %task.status,
            "Cancellation requested but not supported, refusing"
        );
        self.store
            .append_task_log(
                task_id,
                TaskLogEntry::error("Cancellation requested; not supported, task left untouched"),
            )
            .await?;
        Ok(false)
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.store.get_task(task_id).await
    }

    /// List tasks with logs truncated to a short tail
    pub async fn list_tasks(&self, filter: TaskFilter, page: Page) -> Result<Vec<Task>> {
        let tasks = self.store.list_tasks(filter, page).await?;
        Ok(tasks
            .into_iter()
            .map(|task| task.with_log_tail(LIST_LOG_TAIL))
            .collect())
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let counts = self.store.queue_counts().await?;
        Ok(QueueStats {
            running: counts.running,
            queued: counts.queued,
            max_concurrent: self.config.max_concurrent_tasks,
        })
    }

    /// Delete terminal tasks older than the retention window
    pub async fn purge_expired_tasks(&self) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention_window)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        let purged = self.store.purge_terminal_before(cutoff).await?;
        if purged > 0 {
            info!(count = purged, "Purged terminal tasks past retention");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::TaskStatus;
    use crate::store::InMemoryTaskStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct OkStep {
        name: &'static str,
        calls: AtomicU32,
    }

    impl OkStep {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl StepExecutor for OkStep {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _context: &StepContext) -> std::result::Result<Value, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"step": self.name}))
        }
    }

    struct FailingStep {
        name: &'static str,
        transient: bool,
    }

    #[async_trait]
    impl StepExecutor for FailingStep {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _context: &StepContext) -> std::result::Result<Value, StepError> {
            let err = anyhow::anyhow!("{} refused the input", self.name);
            if self.transient {
                Err(StepError::transient(err))
            } else {
                Err(StepError::permanent(err))
            }
        }
    }

    fn manager_with(steps: Vec<Arc<dyn StepExecutor>>) -> TaskManager {
        TaskManager::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(PipelineRegistry::new(steps).unwrap()),
            OrchestratorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_create_task_validates_regen_target() {
        let manager = manager_with(vec![OkStep::new("recognize")]);

        let err = manager
            .create_task(
                TaskType::RegenerateStep,
                "doc-1",
                TaskParams {
                    target_step: Some("missing".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DocflowError::ValidationError(_)));

        let err = manager
            .create_task(TaskType::RegenerateStep, "doc-1", TaskParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DocflowError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_full_pipeline_runs_to_success() {
        let first = OkStep::new("recognize");
        let second = OkStep::new("translate");
        let manager = manager_with(vec![first.clone(), second.clone()]);

        manager
            .create_task(TaskType::FullPipeline, "doc-1", TaskParams::default())
            .await
            .unwrap();
        let claimed = manager.claim_next().await.unwrap().unwrap();
        let done = manager.execute(claimed).await.unwrap();

        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.current_step, 2);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert!(done.lease.is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_pipeline_resumable() {
        let manager = manager_with(vec![
            OkStep::new("recognize"),
            Arc::new(FailingStep {
                name: "translate",
                transient: true,
            }),
        ]);

        manager
            .create_task(TaskType::FullPipeline, "doc-1", TaskParams::default())
            .await
            .unwrap();
        let claimed = manager.claim_next().await.unwrap().unwrap();
        let done = manager.execute(claimed).await.unwrap();

        assert_eq!(done.status, TaskStatus::StepFailed);
        // The completed first step survives for the resume
        assert_eq!(done.current_step, 1);
        assert!(done.last_error.is_some());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_terminal() {
        let manager = manager_with(vec![Arc::new(FailingStep {
            name: "recognize",
            transient: false,
        })]);

        manager
            .create_task(TaskType::FullPipeline, "doc-1", TaskParams::default())
            .await
            .unwrap();
        let claimed = manager.claim_next().await.unwrap().unwrap();
        let done = manager.execute(claimed).await.unwrap();

        assert_eq!(done.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_regen_failure_is_terminal_even_when_transient() {
        let manager = manager_with(vec![Arc::new(FailingStep {
            name: "recognize",
            transient: true,
        })]);

        manager
            .create_task(
                TaskType::RegenerateStep,
                "doc-1",
                TaskParams {
                    target_step: Some("recognize".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let claimed = manager.claim_next().await.unwrap().unwrap();
        let done = manager.execute(claimed).await.unwrap();

        assert_eq!(done.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_is_refused() {
        let manager = manager_with(vec![OkStep::new("recognize")]);
        let task = manager
            .create_task(TaskType::FullPipeline, "doc-1", TaskParams::default())
            .await
            .unwrap();

        assert!(!manager.cancel_task(task.task_id).await.unwrap());
        let unchanged = manager.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TaskStatus::Pending);
        // The refusal is recorded in the task's log
        let last = unchanged.logs.last().unwrap();
        assert_eq!(last.level, "ERROR");
        assert!(last.message.contains("Cancellation requested"));
    }
}
