//! Persistence port for saga executions
//!
//! The engine writes one [`SagaExecutionRecord`] per execution, keyed by
//! correlation id; the recovery service reads and repairs them. Any adapter
//! implementing [`SagaPersistence`] can be plugged in.
//!
//! - [`InMemorySagaPersistence`]: volatile, DashMap-backed. Everything is lost
//!   on restart; durable deployments supply their own adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::{Display, EnumString};
use thiserror::Error;

mod memory;

pub use memory::InMemorySagaPersistence;

use super::context::StepStatus;

pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Execution not found: {correlation_id}")]
    NotFound { correlation_id: String },

    #[error("Persistence backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    InFlight,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
}

/// Durable shape of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaExecutionRecord {
    pub correlation_id: String,
    pub saga_name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub successful: bool,
    pub steps: HashMap<String, StepRecord>,
}

impl SagaExecutionRecord {
    /// Fresh `IN_FLIGHT` record with every step `PENDING`
    pub fn in_flight<I, S>(
        correlation_id: impl Into<String>,
        saga_name: impl Into<String>,
        step_ids: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            correlation_id: correlation_id.into(),
            saga_name: saga_name.into(),
            status: ExecutionStatus::InFlight,
            started_at: Utc::now(),
            completed_at: None,
            successful: false,
            steps: step_ids
                .into_iter()
                .map(|id| {
                    (
                        id.into(),
                        StepRecord {
                            status: StepStatus::Pending,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == ExecutionStatus::InFlight
    }
}

/// Storage contract used by the engine and the recovery service
///
/// Implementations must be safe for concurrent use; writes for different
/// correlation ids never conflict.
#[async_trait]
pub trait SagaPersistence: Send + Sync + 'static {
    /// Insert or replace the record for `record.correlation_id`
    async fn persist_state(&self, record: SagaExecutionRecord) -> PersistenceResult<()>;

    async fn get_state(&self, correlation_id: &str) -> PersistenceResult<Option<SagaExecutionRecord>>;

    async fn update_step_status(
        &self,
        correlation_id: &str,
        step_id: &str,
        status: StepStatus,
    ) -> PersistenceResult<()>;

    /// Move the execution to `COMPLETED` or `FAILED` and stamp `completed_at`
    async fn mark_completed(&self, correlation_id: &str, successful: bool) -> PersistenceResult<()>;

    async fn get_in_flight(&self) -> PersistenceResult<Vec<SagaExecutionRecord>>;

    /// Every record whose `started_at` is earlier than `before`, whatever its status
    async fn get_stale(&self, before: DateTime<Utc>) -> PersistenceResult<Vec<SagaExecutionRecord>>;

    /// Delete terminal records completed before `older_than`; returns how many
    async fn cleanup(&self, older_than: DateTime<Utc>) -> PersistenceResult<usize>;

    async fn is_healthy(&self) -> bool;
}
