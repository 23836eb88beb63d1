//! Orchestration system bootstrap.
//!
//! [`Orchestrator`] wires the store, pipeline registry, resource pools, and
//! worker loops together behind one explicit root object. Embedders build it
//! once at startup and route both producer calls (create, kick) and
//! operational calls (stats, listings) through it.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::logging::init_structured_logging;
use crate::models::{Page, Task, TaskFilter, TaskParams, TaskType};
use crate::orchestration::task_manager::{QueueStats, TaskManager};
use crate::orchestration::worker::WorkerPool;
use crate::pipeline::PipelineRegistry;
use crate::pool::{PoolJob, PoolStats, ResourcePools, SubmitOutcome};
use crate::store::TaskStore;

pub struct Orchestrator {
    manager: Arc<TaskManager>,
    pools: Arc<ResourcePools>,
    workers: WorkerPool,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn TaskStore>,
        registry: Arc<PipelineRegistry>,
    ) -> Result<Self> {
        init_structured_logging();
        config.validate()?;

        let pools = Arc::new(ResourcePools::from_config(&config.pools));
        let manager = Arc::new(TaskManager::new(store, registry, config.clone()));
        let workers = WorkerPool::new(manager.clone(), config.clone());

        info!(
            max_concurrent_tasks = config.max_concurrent_tasks,
            worker_count = config.worker_count,
            pools = config.pools.len(),
            "Orchestrator initialized"
        );

        Ok(Self {
            manager,
            pools,
            workers,
            config,
        })
    }

    /// Begin claiming and executing tasks
    pub fn start(&mut self) {
        self.workers.start();
    }

    /// Stop worker loops, then drain the resource pools
    pub async fn shutdown(&mut self, timeout: Duration) {
        self.workers.stop(timeout).await;
        self.pools.shutdown(timeout).await;
        info!("Orchestrator shut down");
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    pub fn pools(&self) -> &Arc<ResourcePools> {
        &self.pools
    }

    // Producer surface

    pub async fn create_task(
        &self,
        task_type: TaskType,
        subject_reference: &str,
        params: TaskParams,
    ) -> Result<Task> {
        self.manager
            .create_task(task_type, subject_reference, params)
            .await
    }

    pub async fn kick_task(&self, task_id: Uuid) -> Result<bool> {
        self.manager.kick_task(task_id).await
    }

    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool> {
        self.manager.cancel_task(task_id).await
    }

    // Operational surface

    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.manager.get_task(task_id).await
    }

    pub async fn list_tasks(&self, filter: TaskFilter, page: Page) -> Result<Vec<Task>> {
        self.manager.list_tasks(filter, page).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.manager.queue_stats().await
    }

    pub fn pool_stats(&self, name: &str) -> Result<PoolStats> {
        self.pools.stats(name)
    }

    pub fn all_pool_stats(&self) -> Vec<PoolStats> {
        self.pools.all_stats()
    }

    // Auxiliary background work, routed through the named pools

    pub fn submit(&self, pool_name: &str, job: PoolJob) -> Result<SubmitOutcome> {
        self.pools.submit(pool_name, job)
    }

    pub async fn dispatch(&self, pool_name: &str, job: PoolJob) -> Result<bool> {
        self.pools.dispatch(pool_name, job).await
    }
}
