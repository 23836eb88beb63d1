//! # Docflow Core
//!
//! Background task orchestration for multi-step content processing.
//!
//! ## Architecture
//!
//! Producers create tasks; a pool of pollers claims them under the global
//! concurrency ceiling and runs the pipeline checkpoint-per-step, so a crash
//! costs at most one step. Worker ownership is a time-bounded lease: every
//! store write a worker makes is conditional on its lease still being live,
//! and a recovery loop re-admits tasks whose lease expired without an
//! outcome.
//!
//! - [`models`]: task, step, and lease data model
//! - [`state_machine`]: the pure status transition function
//! - [`store`]: the [`store::TaskStore`] port with in-memory and Postgres
//!   adapters
//! - [`pipeline`]: the [`pipeline::StepExecutor`] contract and fixed-order
//!   registry
//! - [`orchestration`]: claiming, execution, and the background loops
//! - [`pool`]: named resource pools with synchronous fallback
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use docflow_core::config::OrchestratorConfig;
//! use docflow_core::models::{TaskParams, TaskType};
//! use docflow_core::orchestration::Orchestrator;
//! use docflow_core::pipeline::PipelineRegistry;
//! use docflow_core::store::InMemoryTaskStore;
//!
//! # async fn run(steps: Vec<Arc<dyn docflow_core::pipeline::StepExecutor>>) -> docflow_core::error::Result<()> {
//! let registry = Arc::new(PipelineRegistry::new(steps)?);
//! let store = Arc::new(InMemoryTaskStore::new());
//! let mut orchestrator = Orchestrator::new(OrchestratorConfig::default(), store, registry)?;
//! orchestrator.start();
//!
//! orchestrator
//!     .create_task(TaskType::FullPipeline, "doc-42", TaskParams::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod pipeline;
pub mod pool;
pub mod state_machine;
pub mod store;

pub use config::OrchestratorConfig;
pub use error::{DocflowError, Result};
pub use models::{Task, TaskParams, TaskType};
pub use orchestration::{Orchestrator, QueueStats};
pub use pipeline::{PipelineRegistry, StepContext, StepError, StepExecutor};
pub use pool::{PoolConfig, PoolStats, ResourcePools};
pub use state_machine::{target_status, TaskEvent, TaskStatus};
pub use store::{InMemoryTaskStore, TaskStore};

#[cfg(feature = "postgres")]
pub use store::PgTaskStore;
