use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::context::{SagaContext, StepStatus};
use super::invoker::StepInvoker;
use super::persistence::SagaPersistence;
use super::registry::SagaDefinition;
use super::step::{backoff_delay, StepDefinition};
use crate::error::StepError;
use crate::events::SagaEvents;

/// How the forward pass ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestrationOutcome {
    /// First failed step by id, when the saga failed
    pub failed_step: Option<String>,
    pub error: Option<String>,
}

impl OrchestrationOutcome {
    pub fn is_success(&self) -> bool {
        self.failed_step.is_none()
    }
}

/// Runs the forward pass of a saga, layer by layer
///
/// Steps of a layer start concurrently, bounded by the layer concurrency
/// limit. The next layer is admitted only when every step of the current one
/// finished `DONE`.
#[derive(Clone)]
pub struct SagaExecutionOrchestrator {
    invoker: StepInvoker,
    events: Arc<dyn SagaEvents>,
    persistence: Option<Arc<dyn SagaPersistence>>,
}

impl SagaExecutionOrchestrator {
    pub fn new(invoker: StepInvoker, events: Arc<dyn SagaEvents>) -> Self {
        Self {
            invoker,
            events,
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn SagaPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub async fn run(
        &self,
        definition: &Arc<SagaDefinition>,
        ctx: &Arc<SagaContext>,
        layer_concurrency: Option<usize>,
    ) -> OrchestrationOutcome {
        for (index, layer) in definition.layers.iter().enumerate() {
            tracing::debug!(
                "Saga {} [{}]: starting layer {} ({} steps)",
                ctx.saga_name(),
                ctx.correlation_id(),
                index,
                layer.len()
            );

            let limit = layer_concurrency.unwrap_or(layer.len()).max(1);
            let semaphore = Arc::new(Semaphore::new(limit));
            let mut set = JoinSet::new();
            let mut tasks = HashMap::new();

            for id in layer {
                let Some(step) = definition.step(id).cloned() else {
                    continue;
                };
                let this = self.clone();
                let ctx = Arc::clone(ctx);
                let semaphore = Arc::clone(&semaphore);
                let handle = set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    this.execute_step(&step, &ctx).await
                });
                tasks.insert(handle.id(), id.clone());
            }

            let mut failures = Vec::new();
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err((step, error))) => failures.push((step, error)),
                    Err(e) => {
                        let Some(step) = tasks.get(&e.id()).cloned() else {
                            tracing::error!("Step task of unknown step aborted: {}", e);
                            continue;
                        };
                        // Hooks are not called again: they may be what panicked.
                        let error = StepError::Panicked(e.to_string()).to_string();
                        tracing::error!("Step {} task aborted: {}", step, error);
                        ctx.record_failure(&step, error.clone(), 0);
                        failures.push((step, error));
                    }
                }
            }

            if !failures.is_empty() {
                failures.sort_by(|a, b| a.0.cmp(&b.0));
                let (step, error) = failures.swap_remove(0);
                tracing::warn!(
                    "Saga {} [{}] failed at step {}: {}",
                    ctx.saga_name(),
                    ctx.correlation_id(),
                    step,
                    error
                );
                return OrchestrationOutcome {
                    failed_step: Some(step),
                    error: Some(error),
                };
            }
        }

        OrchestrationOutcome::default()
    }

    async fn execute_step(&self, step: &StepDefinition, ctx: &SagaContext) -> Result<(), (String, String)> {
        let idempotency_key = step.idempotency_key.as_ref().map(|t| ctx.render_template(t));
        if let Some(key) = &idempotency_key {
            // Claimed before invoking so steps rendering the same key run once.
            if !ctx.record_idempotency_key(key.clone()) {
                tracing::info!("Skipping step {}: idempotency key {} already seen", step.id, key);
                ctx.set_attempts(&step.id, 0);
                ctx.record_success(&step.id, serde_json::Value::Null, 0);
                self.persist_status(ctx, &step.id, StepStatus::Done).await;
                return Ok(());
            }
        }

        ctx.mark_running(&step.id);
        self.persist_status(ctx, &step.id, StepStatus::Running).await;

        let started = Instant::now();
        let mut attempt = 0u32;
        let error = loop {
            ctx.set_attempts(&step.id, attempt + 1);
            match self.invoker.invoke_step(step, ctx).await {
                Ok(value) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    ctx.record_success(&step.id, value, latency_ms);
                    tracing::debug!(
                        "Step {} done after {} attempt(s) in {}ms",
                        step.id,
                        attempt + 1,
                        latency_ms
                    );
                    self.events
                        .on_step_succeeded(
                            ctx.saga_name(),
                            ctx.correlation_id(),
                            &step.id,
                            attempt + 1,
                            latency_ms,
                        )
                        .await;
                    self.persist_status(ctx, &step.id, StepStatus::Done).await;
                    return Ok(());
                }
                Err(e @ StepError::TimedOut { .. }) => break e,
                Err(e) if attempt < step.retry => {
                    let delay = backoff_delay(step.backoff_ms, attempt, step.jitter);
                    tracing::warn!(
                        "Step {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        step.id,
                        attempt + 1,
                        step.retry + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        if let Some(key) = &idempotency_key {
            ctx.release_idempotency_key(key);
        }
        let message = error.to_string();
        ctx.record_failure(&step.id, message.clone(), started.elapsed().as_millis() as u64);
        self.events
            .on_step_failed(ctx.saga_name(), ctx.correlation_id(), &step.id, &message)
            .await;
        self.persist_status(ctx, &step.id, StepStatus::Failed).await;
        Err((step.id.clone(), message))
    }

    async fn persist_status(&self, ctx: &SagaContext, step_id: &str, status: StepStatus) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Err(e) = persistence
            .update_step_status(ctx.correlation_id(), step_id, status)
            .await
        {
            tracing::error!(
                "Failed to persist status {} of step {} [{}]: {}",
                status,
                step_id,
                ctx.correlation_id(),
                e
            );
        }
    }
}
