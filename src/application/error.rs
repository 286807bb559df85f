use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot {operation} task {task_id} while {state}")]
    InvalidTransition {
        task_id: String,
        operation: &'static str,
        state: String,
    },
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("persistence failed at {step}: {source}")]
    PersistenceFailure {
        step: &'static str,
        #[source]
        source: InfraError,
    },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid range: end {end} must be after start {start}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl EngineError {
    pub fn invalid_transition(
        task_id: &str,
        operation: &'static str,
        state: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            task_id: task_id.to_string(),
            operation,
            state: state.into(),
        }
    }

    pub fn persistence(step: &'static str, source: InfraError) -> Self {
        Self::PersistenceFailure { step, source }
    }
}

impl From<InfraError> for EngineError {
    fn from(error: InfraError) -> Self {
        match error {
            InfraError::InvalidConfig(message) => Self::InvalidConfig(message),
            other => Self::persistence("storage", other),
        }
    }
}
