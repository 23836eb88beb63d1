//! Background worker loops.
//!
//! A [`WorkerPool`] runs N poller loops that claim and execute tasks, one
//! recovery loop that re-admits tasks with expired leases, and one retention
//! loop that purges old terminal tasks. All loops share an `AtomicBool`
//! running flag and a `Notify` for prompt shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::orchestration::task_manager::TaskManager;

/// Pause after a store error before polling again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    manager: Arc<TaskManager>,
    config: OrchestratorConfig,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(manager: Arc<TaskManager>, config: OrchestratorConfig) -> Self {
        Self {
            manager,
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            handles: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the poller, recovery, and retention loops
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Worker pool already running, ignoring start");
            return;
        }

        info!(
            workers = self.config.worker_count,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting worker pool"
        );

        for worker_id in 0..self.config.worker_count {
            let manager = self.manager.clone();
            let running = self.running.clone();
            let shutdown = self.shutdown.clone();
            let poll_interval = self.config.poll_interval;
            self.handles.push(tokio::spawn(async move {
                poller_loop(worker_id, manager, running, shutdown, poll_interval).await;
            }));
        }

        {
            let manager = self.manager.clone();
            let running = self.running.clone();
            let shutdown = self.shutdown.clone();
            let interval = self.config.recovery_interval;
            self.handles.push(tokio::spawn(async move {
                periodic_loop("recovery", running, shutdown, interval, move || {
                    let manager = manager.clone();
                    async move { manager.recover_pending().await.map(|_| ()) }
                })
                .await;
            }));
        }

        {
            let manager = self.manager.clone();
            let running = self.running.clone();
            let shutdown = self.shutdown.clone();
            let interval = self.config.retention_sweep_interval;
            self.handles.push(tokio::spawn(async move {
                periodic_loop("retention", running, shutdown, interval, move || {
                    let manager = manager.clone();
                    async move { manager.purge_expired_tasks().await.map(|_| ()) }
                })
                .await;
            }));
        }
    }

    /// Signal every loop to stop and wait up to `timeout` for them to exit.
    /// A task mid-execution finishes its current step loop before exiting.
    pub async fn stop(&mut self, timeout: Duration) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping worker pool");
        self.shutdown.notify_waiters();

        let drain = async {
            for handle in self.handles.drain(..) {
                if let Err(e) = handle.await {
                    error!("Worker loop panicked: {}", e);
                }
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("Worker pool shutdown timed out, abandoning remaining loops");
            self.handles.clear();
        }
        info!("Worker pool stopped");
    }
}

async fn poller_loop(
    worker_id: usize,
    manager: Arc<TaskManager>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    poll_interval: Duration,
) {
    debug!(worker_id, "Poller loop started");
    while running.load(Ordering::SeqCst) {
        let idle_wait = match manager.claim_next().await {
            Ok(Some(task)) => {
                let task_id = task.task_id;
                match manager.execute(task).await {
                    Ok(done) => {
                        debug!(worker_id, task_id = %task_id, status = %done.status, "Task finished");
                    }
                    Err(e) => {
                        // Typically a lost lease; recovery will re-admit the task
                        warn!(worker_id, task_id = %task_id, "Execution aborted: {}", e);
                    }
                }
                // Immediately look for more work after finishing a task
                Duration::ZERO
            }
            Ok(None) => poll_interval,
            Err(e) => {
                error!(worker_id, "Claim failed: {}", e);
                ERROR_BACKOFF
            }
        };

        if idle_wait > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(idle_wait) => {}
                _ = shutdown.notified() => {}
            }
        }
    }
    debug!(worker_id, "Poller loop exited");
}

async fn periodic_loop<F, Fut>(
    name: &'static str,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    interval: Duration,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    debug!(loop_name = name, "Periodic loop started");
    while running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.notified() => continue,
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = tick().await {
            error!(loop_name = name, "Periodic pass failed: {}", e);
        }
    }
    debug!(loop_name = name, "Periodic loop exited");
}
