use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum DocflowError {
    StoreError(String),
    StateTransitionError(String),
    OrchestrationError(String),
    ValidationError(String),
    ConfigurationError(String),
    LeaseConflict(String),
    TaskNotFound(String),
}

impl fmt::Display for DocflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocflowError::StoreError(msg) => write!(f, "Store error: {msg}"),
            DocflowError::StateTransitionError(msg) => write!(f, "State transition error: {msg}"),
            DocflowError::OrchestrationError(msg) => write!(f, "Orchestration error: {msg}"),
            DocflowError::ValidationError(msg) => write!(f, "Validation error: {msg}"),
            DocflowError::ConfigurationError(msg) => write!(f, "Configuration error: {msg}"),
            DocflowError::LeaseConflict(msg) => write!(f, "Lease conflict: {msg}"),
            DocflowError::TaskNotFound(msg) => write!(f, "Task not found: {msg}"),
        }
    }
}

impl std::error::Error for DocflowError {}

pub type Result<T> = std::result::Result<T, DocflowError>;
