//! Named resource pools with bounded admission and synchronous fallback.
//!
//! Each pool owns a fixed worker budget. `submit` either admits a job for
//! background execution or hands it back untouched; callers that must not
//! drop work use `dispatch`, which runs rejected jobs inline on the calling
//! task and reports which path was taken. A saturated pool therefore slows
//! its caller down instead of discarding or unboundedly buffering jobs.

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::error::{DocflowError, Result};

/// A unit of background work. The job owns everything it needs; the pool
/// never inspects it, only runs it.
pub type PoolJob = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Per-pool sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolConfig {
    /// Jobs that may run concurrently
    pub max_workers: usize,
    /// Admitted jobs that may wait for a worker beyond `max_workers`.
    /// Zero means admission capacity equals worker capacity, so a full
    /// pool rejects immediately.
    pub queue_depth: usize,
}

impl PoolConfig {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            queue_depth: 0,
        }
    }

    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }
}

/// Result of a submission attempt. A rejected job comes back to the caller
/// unchanged so it can be run inline.
pub enum SubmitOutcome {
    Accepted,
    Rejected(PoolJob),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

#[derive(Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    sync_fallback: AtomicU64,
    in_flight: AtomicUsize,
    active: AtomicUsize,
}

/// Snapshot of one pool's counters
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool_name: String,
    pub max_workers: usize,
    pub active: usize,
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub sync_fallback_count: u64,
}

/// One named pool
pub struct ResourcePool {
    name: String,
    config: PoolConfig,
    /// Admission capacity (`max_workers + queue_depth`). Held from submit
    /// until the job finishes; an exhausted semaphore means rejection.
    admission: Arc<Semaphore>,
    /// Concurrency ceiling for actually running jobs
    workers: Arc<Semaphore>,
    counters: Arc<PoolCounters>,
}

impl ResourcePool {
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        let name = name.into();
        info!(
            "🏊 POOL: Created '{}' with {} workers (queue depth {})",
            name, config.max_workers, config.queue_depth
        );
        Self {
            admission: Arc::new(Semaphore::new(config.max_workers + config.queue_depth)),
            workers: Arc::new(Semaphore::new(config.max_workers)),
            counters: Arc::new(PoolCounters::default()),
            name,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to admit `job` for background execution. On rejection the job is
    /// returned so the caller can run it itself.
    pub fn submit(&self, job: PoolJob) -> SubmitOutcome {
        let permit = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(
                    "🏊 POOL: '{}' is saturated, rejecting submission",
                    self.name
                );
                return SubmitOutcome::Rejected(job);
            }
        };

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);

        let workers = self.workers.clone();
        let counters = self.counters.clone();
        let pool_name = self.name.clone();
        tokio::spawn(async move {
            // Admission permit stays held until the job completes
            let _admission = permit;
            let worker = match workers.acquire_owned().await {
                Ok(worker) => worker,
                Err(_) => {
                    // Pool shut down while the job was queued
                    counters.in_flight.fetch_sub(1, Ordering::Relaxed);
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("🏊 POOL: '{}' closed, dropping queued job", pool_name);
                    return;
                }
            };

            counters.active.fetch_add(1, Ordering::Relaxed);
            let outcome = job().await;
            counters.active.fetch_sub(1, Ordering::Relaxed);
            counters.in_flight.fetch_sub(1, Ordering::Relaxed);
            drop(worker);

            match outcome {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!("🏊 POOL: Job in '{}' failed: {:?}", pool_name, e);
                }
            }
        });

        SubmitOutcome::Accepted
    }

    /// Submit `job`, running it inline when the pool is saturated. Returns
    /// `true` when the job went to the pool and `false` when it ran on the
    /// calling task. Job errors are counted and logged on both paths.
    pub async fn dispatch(&self, job: PoolJob) -> bool {
        match self.submit(job) {
            SubmitOutcome::Accepted => true,
            SubmitOutcome::Rejected(job) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                self.counters.sync_fallback.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "🏊 POOL: '{}' saturated, executing job synchronously",
                    self.name
                );
                match job().await {
                    Ok(()) => {
                        self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!(
                            "🏊 POOL: Synchronous job in '{}' failed: {:?}",
                            self.name, e
                        );
                    }
                }
                false
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let active = self.counters.active.load(Ordering::Relaxed);
        let in_flight = self.counters.in_flight.load(Ordering::Relaxed);
        PoolStats {
            pool_name: self.name.clone(),
            max_workers: self.config.max_workers,
            active,
            queued: in_flight.saturating_sub(active),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            sync_fallback_count: self.counters.sync_fallback.load(Ordering::Relaxed),
        }
    }

    /// Stop admitting new jobs. Jobs already admitted keep running.
    pub fn close(&self) {
        self.admission.close();
    }

    /// Wait for in-flight jobs to finish, up to `timeout`
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.counters.in_flight.load(Ordering::Relaxed) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "🏊 POOL: '{}' drain timed out with {} jobs in flight",
                    self.name,
                    self.counters.in_flight.load(Ordering::Relaxed)
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

/// Registry of named pools. Pool names are fixed at construction; submitting
/// to an unknown pool is a caller error, not a silent no-op.
pub struct ResourcePools {
    pools: DashMap<String, Arc<ResourcePool>>,
}

impl ResourcePools {
    pub fn from_config(configs: &HashMap<String, PoolConfig>) -> Self {
        let pools = DashMap::new();
        for (name, config) in configs {
            pools.insert(
                name.clone(),
                Arc::new(ResourcePool::new(name.clone(), *config)),
            );
        }
        info!("🏊 POOL: Registry initialized with {} pools", pools.len());
        Self { pools }
    }

    pub fn get(&self, name: &str) -> Result<Arc<ResourcePool>> {
        self.pools
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DocflowError::ValidationError(format!("unknown pool '{name}'")))
    }

    pub fn submit(&self, name: &str, job: PoolJob) -> Result<SubmitOutcome> {
        Ok(self.get(name)?.submit(job))
    }

    pub async fn dispatch(&self, name: &str, job: PoolJob) -> Result<bool> {
        let pool = self.get(name)?;
        Ok(pool.dispatch(job).await)
    }

    pub fn stats(&self, name: &str) -> Result<PoolStats> {
        Ok(self.get(name)?.stats())
    }

    pub fn all_stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self
            .pools
            .iter()
            .map(|entry| entry.value().stats())
            .collect();
        stats.sort_by(|a, b| a.pool_name.cmp(&b.pool_name));
        stats
    }

    /// Close every pool and wait for their jobs to drain
    pub async fn shutdown(&self, timeout: Duration) {
        let pools: Vec<Arc<ResourcePool>> = self
            .pools
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for pool in &pools {
            pool.close();
        }
        for pool in &pools {
            pool.drain(timeout).await;
        }
        info!("🏊 POOL: Registry shut down");
    }
}

/// Wrap an async closure's future as a [`PoolJob`]
pub fn pool_job<F, Fut>(f: F) -> PoolJob
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn submission_respects_admission_capacity() {
        let pool = ResourcePool::new("test", PoolConfig::new(1));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = pool.submit(pool_job(move || async move {
            let _ = release_rx.await;
            Ok(())
        }));
        assert!(first.is_accepted());

        // Worker budget is spent, so the second submission bounces
        let second = pool.submit(pool_job(|| async { Ok(()) }));
        assert!(matches!(second, SubmitOutcome::Rejected(_)));

        release_tx.send(()).unwrap();
        assert!(pool.drain(Duration::from_secs(1)).await);
        assert_eq!(pool.stats().completed, 1);
    }

    #[tokio::test]
    async fn queue_depth_extends_admission_beyond_workers() {
        let pool = ResourcePool::new("test", PoolConfig::new(1).with_queue_depth(1));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        // One job running, one waiting for the worker
        assert!(pool
            .submit(pool_job(move || async move {
                let _ = release_rx.await;
                Ok(())
            }))
            .is_accepted());
        assert!(pool.submit(pool_job(|| async { Ok(()) })).is_accepted());

        // Admission capacity (workers + depth) is spent
        assert!(matches!(
            pool.submit(pool_job(|| async { Ok(()) })),
            SubmitOutcome::Rejected(_)
        ));

        release_tx.send(()).unwrap();
        assert!(pool.drain(Duration::from_secs(1)).await);
        assert_eq!(pool.stats().completed, 2);
    }

    #[tokio::test]
    async fn dispatch_falls_back_to_inline_execution() {
        let pool = Arc::new(ResourcePool::new("test", PoolConfig::new(1)));
        let ran_inline = Arc::new(AtomicU32::new(0));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        assert!(
            pool.dispatch(pool_job(move || async move {
                let _ = release_rx.await;
                Ok(())
            }))
            .await
        );

        // The fallback job must have finished before dispatch returns
        let counter = ran_inline.clone();
        let went_async = pool
            .dispatch(pool_job(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .await;
        assert!(!went_async);
        assert_eq!(ran_inline.load(Ordering::SeqCst), 1);

        let stats = pool.stats();
        assert_eq!(stats.sync_fallback_count, 1);

        release_tx.send(()).unwrap();
        assert!(pool.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn pools_are_isolated() {
        let mut configs = HashMap::new();
        configs.insert("narrow".to_string(), PoolConfig::new(1));
        configs.insert("wide".to_string(), PoolConfig::new(4));
        let pools = ResourcePools::from_config(&configs);

        // Saturate the narrow pool
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        assert!(pools
            .submit(
                "narrow",
                pool_job(move || async move {
                    let _ = release_rx.await;
                    Ok(())
                })
            )
            .unwrap()
            .is_accepted());

        // The wide pool still admits work
        assert!(pools
            .submit("wide", pool_job(|| async { Ok(()) }))
            .unwrap()
            .is_accepted());

        assert!(pools.submit("missing", pool_job(|| async { Ok(()) })).is_err());

        release_tx.send(()).unwrap();
        pools.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failed_jobs_are_counted() {
        let pool = ResourcePool::new("test", PoolConfig::new(2));
        assert!(pool
            .submit(pool_job(|| async { Err(anyhow::anyhow!("boom")) }))
            .is_accepted());
        assert!(pool.drain(Duration::from_secs(1)).await);

        let stats = pool.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
    }
}
