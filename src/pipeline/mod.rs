//! # Pipeline Step Contract
//!
//! ## Architecture: Fixed-Order Step Registry
//!
//! Step implementations (recognition, translation, analysis, classification,
//! …) are opaque to the orchestrator: each one is a [`StepExecutor`] trait
//! object exposing a single `execute(context)` contract. A pipeline is an
//! ordered list of such steps fixed at registration time; the order is never
//! resolved dynamically per task.
//!
//! Retries happen only through the outer resume mechanism for full-pipeline
//! tasks; a step must not retry internally, and a step resumed after a crash
//! is invoked again, so its side effects need to be idempotent if that
//! matters to the step.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{DocflowError, Result};

/// Everything a step sees about the task invoking it
#[derive(Debug, Clone)]
pub struct StepContext {
    pub task_id: Uuid,
    /// Opaque id of the content being processed
    pub subject_reference: String,
    /// 1-based invocation count for this step, across resumes
    pub attempt: u32,
    /// Outputs of previously completed steps, keyed by step name
    pub prior_outputs: serde_json::Map<String, Value>,
    /// Task-scoped instruction override (regenerate-step tasks only)
    pub instruction_override: Option<String>,
    /// Caller-supplied task context
    pub params: Value,
}

/// Step failure taxonomy.
///
/// Transient failures are resumable for full-pipeline tasks; permanent
/// failures (unprocessable input) are terminal regardless of task type.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("transient step failure: {0}")]
    Transient(#[source] anyhow::Error),
    #[error("permanent step failure: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl StepError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// One atomic pipeline stage.
///
/// Implementations perform the actual content transformation and are invoked
/// in the registry's fixed order. They must raise rather than swallow
/// failures and must not retry internally.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Stable step name, used for checkpoints and regen targeting
    fn name(&self) -> &str;

    /// Run the stage once. Idempotence under resume is this implementation's
    /// responsibility, not the orchestrator's.
    async fn execute(&self, context: &StepContext) -> std::result::Result<Value, StepError>;
}

/// Ordered step list for the full pipeline, fixed at registration time.
///
/// Regenerate-step tasks target one member of the same list by name.
pub struct PipelineRegistry {
    steps: Vec<Arc<dyn StepExecutor>>,
    positions: HashMap<String, usize>,
}

impl PipelineRegistry {
    pub fn new(steps: Vec<Arc<dyn StepExecutor>>) -> Result<Self> {
        if steps.is_empty() {
            return Err(DocflowError::ValidationError(
                "pipeline registry requires at least one step".to_string(),
            ));
        }

        let mut positions = HashMap::new();
        for (index, step) in steps.iter().enumerate() {
            if positions.insert(step.name().to_string(), index).is_some() {
                return Err(DocflowError::ValidationError(format!(
                    "duplicate step name '{}' in pipeline registry",
                    step.name()
                )));
            }
        }

        Ok(Self { steps, positions })
    }

    pub fn steps(&self) -> &[Arc<dyn StepExecutor>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn get(&self, step_name: &str) -> Option<Arc<dyn StepExecutor>> {
        self.positions
            .get(step_name)
            .map(|&index| self.steps[index].clone())
    }

    /// Validate a regen target, mirroring producer-side input checking
    pub fn ensure_known_step(&self, step_name: &str) -> Result<()> {
        if self.positions.contains_key(step_name) {
            Ok(())
        } else {
            Err(DocflowError::ValidationError(format!(
                "unknown step '{step_name}', expected one of: {}",
                self.step_names().join(", ")
            )))
        }
    }
}
