use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use super::context::{SagaContext, StepStatus};

/// Final state of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub attempts: u32,
    pub latency_ms: u64,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// True once the step's compensation ran successfully
    pub compensated: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub compensation_result: Option<Value>,
    pub compensation_error: Option<String>,
}

/// Immutable report of one saga execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaResult {
    pub saga_name: String,
    pub correlation_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    /// The error that made the saga fail
    pub error: Option<String>,
    /// Set when a compensation marked critical failed
    pub compensation_failure: Option<String>,
    pub headers: HashMap<String, String>,
    pub steps: BTreeMap<String, StepOutcome>,
    compensation_order: Vec<String>,
}

impl SagaResult {
    pub(crate) fn from_context(
        ctx: &SagaContext,
        started_at: DateTime<Utc>,
        success: bool,
        error: Option<String>,
        compensation_failure: Option<String>,
    ) -> Self {
        let steps = ctx
            .step_ids()
            .into_iter()
            .map(|id| {
                let outcome = StepOutcome {
                    status: ctx.status(&id),
                    attempts: ctx.attempts(&id),
                    latency_ms: ctx.latency_ms(&id),
                    result: ctx.result(&id),
                    error: ctx.error(&id),
                    compensated: ctx.is_compensated(&id),
                    started_at: ctx.started_at(&id),
                    compensation_result: ctx.compensation_result(&id),
                    compensation_error: ctx.compensation_error(&id),
                };
                (id, outcome)
            })
            .collect();

        Self {
            saga_name: ctx.saga_name().to_string(),
            correlation_id: ctx.correlation_id().to_string(),
            started_at,
            completed_at: Utc::now(),
            success,
            error,
            compensation_failure,
            headers: ctx.headers(),
            steps,
            compensation_order: ctx.compensation_order(),
        }
    }

    pub fn result_of(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id).and_then(|s| s.result.as_ref())
    }

    pub fn step(&self, step_id: &str) -> Option<&StepOutcome> {
        self.steps.get(step_id)
    }

    /// Steps that ended `FAILED`, sorted by id
    pub fn failed_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Compensated steps in the order their compensation completed
    pub fn compensated_steps(&self) -> Vec<String> {
        self.compensation_order.clone()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }
}
