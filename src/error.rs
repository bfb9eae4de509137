use thiserror::Error;

use crate::saga::persistence::PersistenceError;
use crate::saga::topology::TopologyError;

pub type Result<T> = std::result::Result<T, SagaError>;

/// Programmer-facing errors.
///
/// These are raised synchronously while registering sagas, building
/// compositions or resolving a saga by name. Business failures inside a
/// running saga never surface here; they are captured in
/// [`SagaResult`](crate::saga::SagaResult) instead.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("Saga not registered: {name}")]
    UnknownSaga { name: String },

    #[error("Saga already registered: {name}")]
    DuplicateSaga { name: String },

    #[error("Saga '{saga}' declares no steps")]
    EmptySaga { saga: String },

    #[error("Saga '{saga}' declares step '{step}' more than once")]
    DuplicateStep { saga: String, step: String },

    #[error("Step '{step}' in saga '{saga}' depends on undeclared step '{dependency}'")]
    MissingDependency {
        saga: String,
        step: String,
        dependency: String,
    },

    #[error("Compensation '{compensation}' for step '{step}' in saga '{saga}' cannot be resolved")]
    UnresolvedCompensation {
        saga: String,
        step: String,
        compensation: String,
    },

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("Invalid composition '{composition}': {message}")]
    InvalidComposition {
        composition: String,
        message: String,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Invalid configuration for {key}: {message}")]
    Config { key: String, message: String },
}

impl SagaError {
    pub fn invalid_composition(composition: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidComposition {
            composition: composition.into(),
            message: message.into(),
        }
    }

    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Failure of a single step or compensation attempt.
///
/// Rendered to a string and recorded in the saga context; callers observe it
/// through [`StepOutcome::error`](crate::saga::StepOutcome).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("Timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    #[error("Step task panicked: {0}")]
    Panicked(String),

    #[error("Worker pool unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Circuit open: compensation for '{step}' not attempted")]
    CircuitOpen { step: String },
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        StepError::Failed(format!("{:#}", err))
    }
}
