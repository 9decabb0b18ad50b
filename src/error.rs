use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Engine not found: {0}")]
    EngineNotFound(String),

    #[error("{entity} {id} is {actual}, expected {expected}")]
    InvalidState {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DispatchError {
    pub fn invalid_job_state(
        id: Uuid,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        DispatchError::InvalidState {
            entity: "Job",
            id: id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn invalid_engine_state(
        id: &str,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        DispatchError::InvalidState {
            entity: "Engine",
            id: id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DispatchError::JobNotFound(_) | DispatchError::EngineNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
