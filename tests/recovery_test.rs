//! Crash recovery: lease expiry re-admission, stale-worker write rejection,
//! and terminal-task immutability.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use docflow_core::config::OrchestratorConfig;
use docflow_core::error::DocflowError;
use docflow_core::models::{StepResult, StepStatus, TaskParams, TaskType};
use docflow_core::orchestration::TaskManager;
use docflow_core::pipeline::{PipelineRegistry, StepContext, StepError, StepExecutor};
use docflow_core::state_machine::TaskStatus;
use docflow_core::store::{InMemoryTaskStore, StepCheckpoint, TaskStore};

struct NoopStep(&'static str);

#[async_trait]
impl StepExecutor for NoopStep {
    fn name(&self) -> &str {
        self.0
    }

    async fn execute(&self, _context: &StepContext) -> Result<Value, StepError> {
        Ok(Value::Null)
    }
}

struct AlwaysFails(&'static str);

#[async_trait]
impl StepExecutor for AlwaysFails {
    fn name(&self) -> &str {
        self.0
    }

    async fn execute(&self, _context: &StepContext) -> Result<Value, StepError> {
        Err(StepError::transient(anyhow::anyhow!("backend unavailable")))
    }
}

fn succeeded_result(step_name: &str, attempts: u32) -> StepResult {
    let now = Utc::now();
    StepResult {
        step_name: step_name.to_string(),
        status: StepStatus::Succeeded,
        started_at: now,
        finished_at: now,
        error: None,
        attempts,
        output: Some(json!({})),
    }
}

#[tokio::test]
async fn expired_lease_is_recovered_and_stale_writes_rejected() {
    let store = Arc::new(InMemoryTaskStore::new());
    let config = OrchestratorConfig {
        lease_duration: Duration::from_millis(200),
        ..Default::default()
    };
    let manager = Arc::new(TaskManager::new(
        store.clone(),
        Arc::new(PipelineRegistry::new(vec![
            Arc::new(NoopStep("extract")) as Arc<dyn StepExecutor>,
            Arc::new(NoopStep("translate")),
        ])
        .unwrap()),
        config,
    ));

    let task = manager
        .create_task(TaskType::FullPipeline, "doc-1", TaskParams::default())
        .await
        .unwrap();

    // A worker claims the task, then "crashes" by never writing again
    let crashed = manager.claim_next().await.unwrap().unwrap();
    let crashed_token = crashed.lease.unwrap().owner_token;

    // The task stays invisible to recovery while the lease is live
    assert!(manager.recover_pending().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let recovered = manager.recover_pending().await.unwrap();
    assert_eq!(recovered, vec![task.task_id]);

    let requeued = store.get_task(task.task_id).await.unwrap().unwrap();
    assert_eq!(requeued.status, TaskStatus::Queued);
    assert!(requeued.lease.is_none());

    // A second worker picks it up under a fresh lease
    let reclaimed = manager.claim_next().await.unwrap().unwrap();
    assert_eq!(reclaimed.task_id, task.task_id);
    let fresh_token = reclaimed.lease.unwrap().owner_token;
    assert_ne!(fresh_token, crashed_token);

    // The crashed worker wakes up and tries to checkpoint; its write bounces
    let stale = store
        .checkpoint_step(
            StepCheckpoint {
                task_id: task.task_id,
                owner_token: crashed_token,
                step_index: 0,
                result: succeeded_result("extract", 1),
            },
            Duration::from_secs(30),
        )
        .await;
    assert!(matches!(stale, Err(DocflowError::LeaseConflict(_))));

    // The live worker's checkpoint goes through
    let fresh = store
        .checkpoint_step(
            StepCheckpoint {
                task_id: task.task_id,
                owner_token: fresh_token,
                step_index: 0,
                result: succeeded_result("extract", 1),
            },
            Duration::from_secs(30),
        )
        .await
        .unwrap();
    assert_eq!(fresh.current_step, 1);
}

#[tokio::test]
async fn failed_regen_is_never_revisited() {
    let store = Arc::new(InMemoryTaskStore::new());
    let manager = Arc::new(TaskManager::new(
        store.clone(),
        Arc::new(
            PipelineRegistry::new(vec![Arc::new(AlwaysFails("extract")) as Arc<dyn StepExecutor>])
                .unwrap(),
        ),
        OrchestratorConfig::default(),
    ));

    let task = manager
        .create_task(
            TaskType::RegenerateStep,
            "doc-1",
            TaskParams {
                target_step: Some("extract".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let claimed = manager.claim_next().await.unwrap().unwrap();
    let done = manager.execute(claimed).await.unwrap();
    assert_eq!(done.status, TaskStatus::Failed);

    // Neither recovery nor claiming ever touches it again
    assert!(manager.recover_pending().await.unwrap().is_empty());
    assert!(manager.claim_next().await.unwrap().is_none());
    assert!(!manager.kick_task(task.task_id).await.unwrap());

    let untouched = store.get_task(task.task_id).await.unwrap().unwrap();
    assert_eq!(untouched.status, TaskStatus::Failed);
}

#[tokio::test]
async fn attempt_budget_turns_transient_failures_terminal() {
    let store = Arc::new(InMemoryTaskStore::new());
    let config = OrchestratorConfig {
        max_step_attempts: 2,
        ..Default::default()
    };
    let manager = Arc::new(TaskManager::new(
        store.clone(),
        Arc::new(
            PipelineRegistry::new(vec![Arc::new(AlwaysFails("extract")) as Arc<dyn StepExecutor>])
                .unwrap(),
        ),
        config,
    ));

    manager
        .create_task(TaskType::FullPipeline, "doc-1", TaskParams::default())
        .await
        .unwrap();

    let claimed = manager.claim_next().await.unwrap().unwrap();
    let after_first = manager.execute(claimed).await.unwrap();
    assert_eq!(after_first.status, TaskStatus::StepFailed);

    // Second attempt reaches the budget and the task fails for good
    let claimed = manager.claim_next().await.unwrap().unwrap();
    let after_second = manager.execute(claimed).await.unwrap();
    assert_eq!(after_second.status, TaskStatus::Failed);
    assert!(manager.claim_next().await.unwrap().is_none());
}
