use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{
    ExecutionStatus, PersistenceError, PersistenceResult, SagaExecutionRecord, SagaPersistence,
    StepRecord,
};
use crate::saga::context::StepStatus;

/// Volatile persistence backed by a `DashMap`
///
/// Suitable for tests and single-process deployments that accept losing
/// in-flight state on restart.
#[derive(Debug, Default)]
pub struct InMemorySagaPersistence {
    records: DashMap<String, SagaExecutionRecord>,
}

impl InMemorySagaPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl SagaPersistence for InMemorySagaPersistence {
    async fn persist_state(&self, record: SagaExecutionRecord) -> PersistenceResult<()> {
        self.records.insert(record.correlation_id.clone(), record);
        Ok(())
    }

    async fn get_state(&self, correlation_id: &str) -> PersistenceResult<Option<SagaExecutionRecord>> {
        Ok(self.records.get(correlation_id).map(|r| r.clone()))
    }

    async fn update_step_status(
        &self,
        correlation_id: &str,
        step_id: &str,
        status: StepStatus,
    ) -> PersistenceResult<()> {
        let mut record = self
            .records
            .get_mut(correlation_id)
            .ok_or_else(|| PersistenceError::NotFound {
                correlation_id: correlation_id.to_string(),
            })?;
        record
            .steps
            .insert(step_id.to_string(), StepRecord { status });
        Ok(())
    }

    async fn mark_completed(&self, correlation_id: &str, successful: bool) -> PersistenceResult<()> {
        let mut record = self
            .records
            .get_mut(correlation_id)
            .ok_or_else(|| PersistenceError::NotFound {
                correlation_id: correlation_id.to_string(),
            })?;
        record.status = if successful {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        record.successful = successful;
        record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn get_in_flight(&self) -> PersistenceResult<Vec<SagaExecutionRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.is_in_flight())
            .map(|r| r.value().clone())
            .collect())
    }

    async fn get_stale(&self, before: DateTime<Utc>) -> PersistenceResult<Vec<SagaExecutionRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.started_at < before)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> PersistenceResult<usize> {
        let before = self.records.len();
        self.records.retain(|_, r| match r.completed_at {
            Some(completed_at) if !r.is_in_flight() => completed_at >= older_than,
            _ => true,
        });
        Ok(before - self.records.len())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}
