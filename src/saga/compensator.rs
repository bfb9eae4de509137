//! Rollback of completed steps
//!
//! Only steps that reached `DONE` are candidates. A candidate without a
//! compensation is skipped and stays `DONE`; nothing is compensated
//! implicitly. Candidates are visited in reverse topology order: layers last
//! to first, and within a layer by descending step id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tokio::task::JoinSet;

use super::context::{SagaContext, StepStatus};
use super::invoker::StepInvoker;
use super::persistence::SagaPersistence;
use super::registry::SagaDefinition;
use super::step::{backoff_delay, StepDefinition};
use crate::error::StepError;
use crate::events::SagaEvents;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationPolicy {
    /// One at a time in reverse order; a critical failure aborts the sweep
    #[default]
    StrictSequential,
    /// Layers in reverse order, steps of one layer concurrently
    GroupedParallel,
    /// Like `StrictSequential`, retrying each compensation with backoff
    RetryWithBackoff,
    /// Sequential; after too many consecutive failures the rest fail unattempted
    CircuitBreaker,
    /// Everything concurrently, never aborting
    BestEffortParallel,
}

/// What a compensation sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    pub policy: CompensationPolicy,
    pub compensated: Vec<String>,
    pub failed: Vec<String>,
    /// Completed steps that declare no compensation
    pub skipped: Vec<String>,
    /// Candidates left untouched after the sweep aborted
    pub not_attempted: Vec<String>,
    /// First critical step whose compensation failed
    pub critical_failure: Option<String>,
}

impl CompensationReport {
    fn record(&mut self, step: &StepDefinition, outcome: &Result<(), StepError>) {
        match outcome {
            Ok(()) => self.compensated.push(step.id.clone()),
            Err(_) => {
                self.failed.push(step.id.clone());
                if step.compensation_critical && self.critical_failure.is_none() {
                    self.critical_failure = Some(step.id.clone());
                }
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.not_attempted.is_empty()
    }
}

#[derive(Clone)]
pub struct SagaCompensator {
    invoker: StepInvoker,
    events: Arc<dyn SagaEvents>,
    persistence: Option<Arc<dyn SagaPersistence>>,
    circuit_breaker_threshold: u32,
}

impl SagaCompensator {
    pub fn new(invoker: StepInvoker, events: Arc<dyn SagaEvents>, circuit_breaker_threshold: u32) -> Self {
        Self {
            invoker,
            events,
            persistence: None,
            circuit_breaker_threshold: circuit_breaker_threshold.max(1),
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn SagaPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Undo every `DONE` step of `ctx` according to `policy`
    pub async fn compensate(
        &self,
        definition: &SagaDefinition,
        ctx: &Arc<SagaContext>,
        policy: CompensationPolicy,
    ) -> CompensationReport {
        let mut report = CompensationReport {
            policy,
            ..Default::default()
        };
        let groups = self.plan(definition, ctx, &mut report);
        let candidates: usize = groups.iter().map(Vec::len).sum();

        tracing::info!(
            "Compensating saga {} [{}] with {} ({} candidate(s), {} without compensation)",
            ctx.saga_name(),
            ctx.correlation_id(),
            policy,
            candidates,
            report.skipped.len()
        );

        match policy {
            CompensationPolicy::StrictSequential => {
                self.run_sequential(groups.into_iter().flatten().collect(), ctx, false, &mut report)
                    .await
            }
            CompensationPolicy::RetryWithBackoff => {
                self.run_sequential(groups.into_iter().flatten().collect(), ctx, true, &mut report)
                    .await
            }
            CompensationPolicy::GroupedParallel => self.run_grouped(groups, ctx, &mut report).await,
            CompensationPolicy::CircuitBreaker => {
                self.run_circuit_breaker(groups.into_iter().flatten().collect(), ctx, &mut report)
                    .await
            }
            CompensationPolicy::BestEffortParallel => {
                let all = groups.into_iter().flatten().collect::<Vec<_>>();
                for (step, outcome) in self.run_concurrently(all, ctx).await {
                    report.record(&step, &outcome);
                }
            }
        }

        if let Some(step) = &report.critical_failure {
            tracing::error!(
                "Critical compensation of {} failed in saga {} [{}]",
                step,
                ctx.saga_name(),
                ctx.correlation_id()
            );
        }
        tracing::info!(
            "Compensation of saga {} [{}] finished: {} compensated, {} failed, {} not attempted",
            ctx.saga_name(),
            ctx.correlation_id(),
            report.compensated.len(),
            report.failed.len(),
            report.not_attempted.len()
        );
        report
    }

    fn plan(
        &self,
        definition: &SagaDefinition,
        ctx: &SagaContext,
        report: &mut CompensationReport,
    ) -> Vec<Vec<Arc<StepDefinition>>> {
        let mut groups = Vec::new();
        for layer in definition.layers.iter().rev() {
            let mut group = Vec::new();
            for id in layer.iter().rev() {
                if ctx.status(id) != StepStatus::Done {
                    continue;
                }
                let Some(step) = definition.step(id) else {
                    continue;
                };
                if step.has_compensation() {
                    group.push(step.clone());
                } else {
                    tracing::debug!("Step {} has no compensation, leaving it DONE", id);
                    report.skipped.push(id.clone());
                }
            }
            if !group.is_empty() {
                groups.push(group);
            }
        }
        groups
    }

    async fn run_sequential(
        &self,
        order: Vec<Arc<StepDefinition>>,
        ctx: &Arc<SagaContext>,
        retrying: bool,
        report: &mut CompensationReport,
    ) {
        let mut remaining = order.into_iter();
        while let Some(step) = remaining.next() {
            let (retries, backoff_ms) = if retrying {
                (
                    step.effective_compensation_retry(),
                    step.effective_compensation_backoff_ms(),
                )
            } else {
                (0, 0)
            };
            let outcome = self.compensate_step(&step, ctx, retries, backoff_ms).await;
            report.record(&step, &outcome);

            if outcome.is_err() {
                if step.compensation_critical {
                    report
                        .not_attempted
                        .extend(remaining.by_ref().map(|s| s.id.clone()));
                    break;
                }
                tracing::warn!(
                    "Compensation of non-critical step {} failed, continuing",
                    step.id
                );
            }
        }
    }

    async fn run_grouped(
        &self,
        groups: Vec<Vec<Arc<StepDefinition>>>,
        ctx: &Arc<SagaContext>,
        report: &mut CompensationReport,
    ) {
        let mut remaining = groups.into_iter();
        while let Some(group) = remaining.next() {
            for (step, outcome) in self.run_concurrently(group, ctx).await {
                report.record(&step, &outcome);
            }
            if report.critical_failure.is_some() {
                report
                    .not_attempted
                    .extend(remaining.by_ref().flatten().map(|s| s.id.clone()));
                break;
            }
        }
    }

    async fn run_circuit_breaker(
        &self,
        order: Vec<Arc<StepDefinition>>,
        ctx: &Arc<SagaContext>,
        report: &mut CompensationReport,
    ) {
        let mut consecutive_failures = 0u32;
        let mut open = false;

        for step in order {
            if open {
                let err = StepError::CircuitOpen {
                    step: step.id.clone(),
                };
                self.record_failure(&step, ctx, &err).await;
                report.record(&step, &Err(err));
                continue;
            }

            let outcome = self.compensate_step(&step, ctx, 0, 0).await;
            report.record(&step, &outcome);
            match outcome {
                Ok(()) => consecutive_failures = 0,
                Err(_) => {
                    consecutive_failures += 1;
                    if step.compensation_critical
                        || consecutive_failures >= self.circuit_breaker_threshold
                    {
                        tracing::warn!(
                            "Compensation circuit opened after {} consecutive failure(s) at {}",
                            consecutive_failures,
                            step.id
                        );
                        open = true;
                    }
                }
            }
        }
    }

    async fn run_concurrently(
        &self,
        steps: Vec<Arc<StepDefinition>>,
        ctx: &Arc<SagaContext>,
    ) -> Vec<(Arc<StepDefinition>, Result<(), StepError>)> {
        let mut set = JoinSet::new();
        let mut tasks = HashMap::new();
        for (index, step) in steps.into_iter().enumerate() {
            let this = self.clone();
            let ctx = Arc::clone(ctx);
            let spawned = Arc::clone(&step);
            let handle = set.spawn(async move {
                let (retries, backoff_ms) = (0, 0);
                let outcome = this.compensate_step(&spawned, &ctx, retries, backoff_ms).await;
                (index, spawned, outcome)
            });
            tasks.insert(handle.id(), (index, step));
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    let Some((index, step)) = tasks.remove(&e.id()) else {
                        tracing::error!("Compensation task of unknown step aborted: {}", e);
                        continue;
                    };
                    let err = StepError::Panicked(e.to_string());
                    tracing::error!("Compensation task of {} aborted: {}", step.id, err);
                    // The undo may have landed before the task died.
                    let outcome = if ctx.is_compensated(&step.id) {
                        Ok(())
                    } else {
                        ctx.record_compensation_error(&step.id, err.to_string());
                        Err(err)
                    };
                    outcomes.push((index, step, outcome));
                }
            }
        }
        outcomes.sort_by_key(|(index, _, _)| *index);
        outcomes
            .into_iter()
            .map(|(_, step, outcome)| (step, outcome))
            .collect()
    }

    async fn compensate_step(
        &self,
        step: &StepDefinition,
        ctx: &SagaContext,
        retries: u32,
        backoff_ms: u64,
    ) -> Result<(), StepError> {
        let timeout_ms = step.effective_compensation_timeout_ms();
        let mut attempt = 0;
        loop {
            let Some(outcome) = self.invoker.invoke_compensation(step, ctx, timeout_ms).await else {
                return Ok(());
            };
            match outcome {
                Ok(value) => {
                    ctx.record_compensation_result(&step.id, value);
                    if let Some(persistence) = &self.persistence {
                        if let Err(e) = persistence
                            .update_step_status(ctx.correlation_id(), &step.id, StepStatus::Compensated)
                            .await
                        {
                            tracing::error!("Failed to persist compensation of {}: {}", step.id, e);
                        }
                    }
                    self.events
                        .on_step_compensated(ctx.saga_name(), ctx.correlation_id(), &step.id, None)
                        .await;
                    return Ok(());
                }
                Err(e) if attempt < retries => {
                    let delay = backoff_delay(backoff_ms, attempt, step.jitter);
                    tracing::warn!(
                        "Compensation of {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        step.id,
                        attempt + 1,
                        retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.record_failure(step, ctx, &e).await;
                    return Err(e);
                }
            }
        }
    }

    async fn record_failure(&self, step: &StepDefinition, ctx: &SagaContext, err: &StepError) {
        let message = err.to_string();
        ctx.record_compensation_error(&step.id, message.clone());
        self.events
            .on_step_compensated(ctx.saga_name(), ctx.correlation_id(), &step.id, Some(&message))
            .await;
    }
}
