use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::compensator::{CompensationPolicy, SagaCompensator};
use super::context::SagaContext;
use super::invoker::StepInvoker;
use super::orchestrator::SagaExecutionOrchestrator;
use super::persistence::{InMemorySagaPersistence, SagaExecutionRecord, SagaPersistence};
use super::recovery::{RecoveryHandle, SagaRecoveryService};
use super::registry::SagaRegistry;
use super::result::SagaResult;
use crate::config::{EngineConfig, WORKER_THREADS};
use crate::error::{Result, SagaError};
use crate::events::{NoopEvents, SagaEvents};
use crate::worker::WorkerPool;

/// Per-call overrides for [`SagaEngine::execute_with`]
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    headers: HashMap<String, String>,
    step_inputs: HashMap<String, Value>,
    compensation_policy: Option<CompensationPolicy>,
    idempotency_keys: Vec<String>,
    correlation_id: Option<String>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Input handed to one step instead of the saga input
    pub fn step_input(mut self, step_id: impl Into<String>, input: Value) -> Self {
        self.step_inputs.insert(step_id.into(), input);
        self
    }

    pub fn compensation_policy(mut self, policy: CompensationPolicy) -> Self {
        self.compensation_policy = Some(policy);
        self
    }

    /// Mark a key as already consumed; steps rendering it are skipped
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_keys.push(key.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Entry point for running registered sagas
///
/// # Example
///
/// ```rust,ignore
/// let registry = Arc::new(SagaRegistry::new());
/// registry.register(declaration)?;
///
/// let engine = SagaEngine::builder(registry)
///     .events(Arc::new(LoggingEvents))
///     .build()?;
///
/// let result = engine.execute("order-fulfillment", json!({ "amount": 100 })).await?;
/// if !result.success {
///     println!("failed: {:?}, compensated: {:?}", result.failed_steps(), result.compensated_steps());
/// }
/// ```
pub struct SagaEngine {
    registry: Arc<SagaRegistry>,
    persistence: Arc<dyn SagaPersistence>,
    events: Arc<dyn SagaEvents>,
    config: EngineConfig,
    orchestrator: SagaExecutionOrchestrator,
    compensator: SagaCompensator,
}

pub struct SagaEngineBuilder {
    registry: Arc<SagaRegistry>,
    persistence: Option<Arc<dyn SagaPersistence>>,
    events: Option<Arc<dyn SagaEvents>>,
    config: EngineConfig,
}

impl SagaEngineBuilder {
    pub fn persistence(mut self, persistence: Arc<dyn SagaPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn events(mut self, events: Arc<dyn SagaEvents>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<SagaEngine> {
        let persistence: Arc<dyn SagaPersistence> = match self.persistence {
            Some(persistence) => persistence,
            None => Arc::new(InMemorySagaPersistence::new()),
        };
        let events: Arc<dyn SagaEvents> = match self.events {
            Some(events) => events,
            None => Arc::new(NoopEvents),
        };
        let pool = WorkerPool::new(self.config.worker_threads)
            .map_err(|e| SagaError::config(WORKER_THREADS, e.to_string()))?;
        let invoker = StepInvoker::new(pool);

        let orchestrator = SagaExecutionOrchestrator::new(invoker.clone(), events.clone())
            .with_persistence(persistence.clone());
        let compensator = SagaCompensator::new(
            invoker,
            events.clone(),
            self.config.circuit_breaker_threshold,
        )
        .with_persistence(persistence.clone());

        tracing::info!(
            "Saga engine ready ({} worker threads, default policy {})",
            self.config.worker_threads,
            self.config.compensation_policy
        );

        Ok(SagaEngine {
            registry: self.registry,
            persistence,
            events,
            config: self.config,
            orchestrator,
            compensator,
        })
    }
}

impl SagaEngine {
    pub fn builder(registry: Arc<SagaRegistry>) -> SagaEngineBuilder {
        SagaEngineBuilder {
            registry,
            persistence: None,
            events: None,
            config: EngineConfig::default(),
        }
    }

    pub fn registry(&self) -> &Arc<SagaRegistry> {
        &self.registry
    }

    pub fn persistence(&self) -> &Arc<dyn SagaPersistence> {
        &self.persistence
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Recovery service sharing this engine's persistence and events
    pub fn recovery_service(&self) -> SagaRecoveryService {
        SagaRecoveryService::new(self.persistence.clone(), self.events.clone())
    }

    /// Start the periodic stale sweep with the configured interval and threshold
    pub fn spawn_recovery(&self) -> RecoveryHandle {
        tracing::info!(
            "Starting saga recovery every {:?} (stale after {:?})",
            self.config.recovery_interval,
            self.config.recovery_stale_threshold
        );
        self.recovery_service().spawn(
            self.config.recovery_interval,
            self.config.recovery_stale_threshold,
        )
    }

    pub async fn execute(&self, saga_name: &str, input: Value) -> Result<SagaResult> {
        self.execute_with(saga_name, input, ExecuteOptions::default()).await
    }

    /// Run `saga_name` to a terminal state.
    ///
    /// A failing step never surfaces as `Err`: the returned result has
    /// `success == false` and records what ran, failed and was compensated.
    /// `Err` is reserved for an unknown saga or a store that cannot record
    /// the start of the execution.
    pub async fn execute_with(
        &self,
        saga_name: &str,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<SagaResult> {
        let definition = self
            .registry
            .get(saga_name)
            .ok_or_else(|| SagaError::UnknownSaga {
                name: saga_name.to_string(),
            })?;

        let ExecuteOptions {
            headers,
            step_inputs,
            compensation_policy,
            idempotency_keys,
            correlation_id,
        } = options;

        let ctx = match correlation_id {
            Some(id) => SagaContext::with_correlation_id(saga_name, id, input),
            None => SagaContext::new(saga_name, input),
        }
        .with_topology(definition.layers.clone(), definition.dependency_map());
        for (name, value) in headers {
            ctx.set_header(name, value);
        }
        for (step_id, value) in step_inputs {
            ctx.set_step_input(step_id, value);
        }
        for key in idempotency_keys {
            ctx.record_idempotency_key(key);
        }
        let ctx = Arc::new(ctx);

        let started_at = Utc::now();
        self.persistence
            .persist_state(
                SagaExecutionRecord::in_flight(ctx.correlation_id(), saga_name, definition.step_ids().cloned())
                    .with_started_at(started_at),
            )
            .await?;

        tracing::info!(
            "Executing saga {} [{}] ({} steps, {} layers)",
            saga_name,
            ctx.correlation_id(),
            definition.steps.len(),
            definition.layers.len()
        );

        let layer_concurrency = definition.layer_concurrency.or(self.config.layer_concurrency);
        let outcome = self.orchestrator.run(&definition, &ctx, layer_concurrency).await;

        let result = if outcome.is_success() {
            SagaResult::from_context(&ctx, started_at, true, None, None)
        } else {
            let policy = compensation_policy
                .or(definition.compensation_policy)
                .unwrap_or(self.config.compensation_policy);
            let report = self.compensator.compensate(&definition, &ctx, policy).await;
            SagaResult::from_context(&ctx, started_at, false, outcome.error, report.critical_failure)
        };

        if let Err(e) = self
            .persistence
            .mark_completed(ctx.correlation_id(), result.success)
            .await
        {
            tracing::error!(
                "Failed to persist terminal state of saga {} [{}]: {}",
                saga_name,
                ctx.correlation_id(),
                e
            );
        }
        self.events
            .on_saga_completed(saga_name, ctx.correlation_id(), result.success)
            .await;

        if result.success {
            tracing::info!(
                "Saga {} [{}] completed in {}ms",
                saga_name,
                result.correlation_id,
                result.duration_ms()
            );
        } else {
            tracing::warn!(
                "Saga {} [{}] failed: {} (compensated: {:?})",
                saga_name,
                result.correlation_id,
                result.error.as_deref().unwrap_or("unknown error"),
                result.compensated_steps()
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BroadcastEvents, SagaEvent, SagaEvents};
    use crate::saga::context::StepStatus;
    use crate::saga::invoker::{Arguments, Param};
    use crate::saga::persistence::ExecutionStatus;
    use crate::saga::registry::SagaDeclaration;
    use crate::saga::step::StepDescriptor;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct PanickingEvents;

    #[async_trait::async_trait]
    impl SagaEvents for PanickingEvents {
        async fn on_saga_completed(&self, _saga_name: &str, _correlation_id: &str, _success: bool) {}

        async fn on_step_failed(&self, _saga_name: &str, _correlation_id: &str, step_id: &str, _error: &str) {
            panic!("event sink crashed on {}", step_id);
        }
    }

    fn ok(id: &str) -> StepDescriptor {
        StepDescriptor::new(id, |_args: Arguments| async { Ok(json!("ok")) })
    }

    fn undoable(id: &str, log: &Arc<Mutex<Vec<String>>>) -> StepDescriptor {
        let log = log.clone();
        let name = id.to_string();
        ok(id).compensate(move |_args: Arguments| {
            log.lock().unwrap().push(name.clone());
            async { Ok(Value::Null) }
        })
    }

    fn failing(id: &str) -> StepDescriptor {
        StepDescriptor::new(id, |_args: Arguments| async {
            Err(anyhow::anyhow!("payment gateway rejected the card"))
        })
    }

    fn engine(registry: SagaRegistry) -> SagaEngine {
        SagaEngine::builder(Arc::new(registry)).build().unwrap()
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = SagaRegistry::new();
        registry
            .register(
                SagaDeclaration::new("happy")
                    .step(undoable("a", &log))
                    .step(undoable("b", &log).depends_on(["a"])),
            )
            .unwrap();
        let engine = engine(registry);

        let result = engine.execute("happy", json!({})).await.unwrap();

        assert!(result.success);
        assert!(result.error.is_none());
        assert!(result.compensated_steps().is_empty());
        assert!(log.lock().unwrap().is_empty());

        let record = engine
            .persistence()
            .get_state(&result.correlation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(record.successful);
        assert_eq!(record.steps["b"].status, StepStatus::Done);
    }

    #[tokio::test]
    async fn test_order_fulfillment_leaves_uncompensated_step_done() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let refunds = Arc::new(Mutex::new(0u32));
        let counter = refunds.clone();
        let registry = SagaRegistry::new();
        registry
            .register(
                SagaDeclaration::new("order-fulfillment")
                    .handler("refund", move |_args: Arguments| {
                        *counter.lock().unwrap() += 1;
                        async { Ok(json!("refunded")) }
                    })
                    .step(ok("reserve-inventory"))
                    .step(
                        failing("charge-payment")
                            .depends_on(["reserve-inventory"])
                            .params([Param::InputField("amount".into())])
                            .retry(2)
                            .backoff_ms(1)
                            .compensate_named("refund"),
                    ),
            )
            .unwrap();
        let engine = engine(registry);

        let result = engine
            .execute("order-fulfillment", json!({ "amount": 100 }))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("rejected the card"));
        assert_eq!(result.failed_steps(), vec!["charge-payment"]);
        assert!(result.compensated_steps().is_empty());
        assert_eq!(*refunds.lock().unwrap(), 0);

        let reserve = result.step("reserve-inventory").unwrap();
        assert_eq!(reserve.status, StepStatus::Done);
        assert!(!reserve.compensated);
        assert_eq!(result.step("charge-payment").unwrap().attempts, 3);

        let record = engine
            .persistence()
            .get_state(&result.correlation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_strict_sequential_compensates_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = SagaRegistry::new();
        registry
            .register(
                SagaDeclaration::new("travel")
                    .step(undoable("flight", &log))
                    .step(undoable("hotel", &log).depends_on(["flight"]))
                    .step(undoable("car", &log).depends_on(["flight"]))
                    .step(failing("insurance").depends_on(["flight"]))
                    .step(undoable("tour", &log).depends_on(["hotel", "insurance"])),
            )
            .unwrap();
        let engine = engine(registry);

        let result = engine.execute("travel", json!({})).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.failed_steps(), vec!["insurance"]);
        assert_eq!(result.compensated_steps(), vec!["hotel", "car", "flight"]);
        assert_eq!(*log.lock().unwrap(), vec!["hotel", "car", "flight"]);
        assert_eq!(result.step("tour").unwrap().status, StepStatus::Pending);
        assert!(result.compensation_failure.is_none());
    }

    #[tokio::test]
    async fn test_unknown_saga_is_an_error() {
        let engine = engine(SagaRegistry::new());
        let err = engine.execute("ghost", Value::Null).await.unwrap_err();
        assert!(matches!(err, SagaError::UnknownSaga { ref name } if name == "ghost"));
        assert!(engine.persistence().get_in_flight().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_options_reach_steps() {
        let registry = SagaRegistry::new();
        registry
            .register(
                SagaDeclaration::new("opts").step(
                    StepDescriptor::new("echo", |args: Arguments| async move {
                        Ok(json!([args.value(0), args.value(1), args.correlation_id()]))
                    })
                    .params([Param::Input, Param::Header("tenant".into())]),
                ),
            )
            .unwrap();
        let engine = engine(registry);

        let result = engine
            .execute_with(
                "opts",
                json!("saga input"),
                ExecuteOptions::new()
                    .header("tenant", "acme")
                    .step_input("echo", json!("step input"))
                    .correlation_id("c-42"),
            )
            .await
            .unwrap();

        assert_eq!(result.correlation_id, "c-42");
        assert_eq!(result.headers["tenant"], "acme");
        assert_eq!(result.result_of("echo"), Some(&json!(["step input", "acme", "c-42"])));
    }

    #[tokio::test]
    async fn test_policy_override_and_critical_failure() {
        let registry = SagaRegistry::new();
        registry
            .register(
                SagaDeclaration::new("critical")
                    .compensation_policy(CompensationPolicy::BestEffortParallel)
                    .step(ok("a").compensate(|_args: Arguments| async {
                        Err(anyhow::anyhow!("ledger offline"))
                    }).compensation_critical(true))
                    .step(ok("b").compensate(|_args: Arguments| async { Ok(Value::Null) }))
                    .step(failing("c").depends_on(["a", "b"])),
            )
            .unwrap();
        let engine = engine(registry);

        let result = engine.execute("critical", Value::Null).await.unwrap();
        assert_eq!(result.compensation_failure.as_deref(), Some("a"));
        assert_eq!(result.compensated_steps(), vec!["b"]);
        assert!(result.step("a").unwrap().compensation_error.as_deref().unwrap().contains("ledger offline"));

        let result = engine
            .execute_with(
                "critical",
                Value::Null,
                ExecuteOptions::new().compensation_policy(CompensationPolicy::StrictSequential),
            )
            .await
            .unwrap();
        assert_eq!(result.compensation_failure.as_deref(), Some("a"));
        assert_eq!(result.compensated_steps(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_completion_events() {
        let events = Arc::new(BroadcastEvents::default());
        let mut rx = events.subscribe();
        let registry = SagaRegistry::new();
        registry
            .register(SagaDeclaration::new("notify").step(ok("a")))
            .unwrap();
        let engine = SagaEngine::builder(Arc::new(registry))
            .events(events)
            .build()
            .unwrap();

        let result = engine.execute("notify", Value::Null).await.unwrap();

        let mut completed = None;
        while let Ok(event) = rx.try_recv() {
            if let SagaEvent::Completed { correlation_id, success, .. } = event {
                completed = Some((correlation_id, success));
            }
        }
        assert_eq!(completed, Some((result.correlation_id, true)));
    }

    #[tokio::test]
    async fn test_panicking_event_sink_still_fails_the_saga() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = SagaRegistry::new();
        registry
            .register(
                SagaDeclaration::new("fragile")
                    .step(undoable("a", &log))
                    .step(failing("b").depends_on(["a"]))
                    .step(ok("c").depends_on(["b"])),
            )
            .unwrap();
        let engine = SagaEngine::builder(Arc::new(registry))
            .events(Arc::new(PanickingEvents))
            .build()
            .unwrap();

        let result = engine.execute("fragile", Value::Null).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.failed_steps(), vec!["b"]);
        assert!(result.error.as_deref().unwrap().contains("panicked"));
        assert_eq!(result.compensated_steps(), vec!["a"]);
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
        assert_eq!(result.step("c").unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_spawn_recovery_uses_config() {
        let store = Arc::new(InMemorySagaPersistence::new());
        store
            .persist_state(
                SagaExecutionRecord::in_flight("stale", "order", ["a"])
                    .with_started_at(Utc::now() - chrono::Duration::seconds(120)),
            )
            .await
            .unwrap();
        store
            .persist_state(SagaExecutionRecord::in_flight("fresh", "order", ["a"]))
            .await
            .unwrap();
        let config = EngineConfig {
            recovery_interval: Duration::from_millis(10),
            recovery_stale_threshold: Duration::from_secs(60),
            ..EngineConfig::default()
        };
        let engine = SagaEngine::builder(Arc::new(SagaRegistry::new()))
            .persistence(store.clone())
            .config(config)
            .build()
            .unwrap();

        let handle = engine.spawn_recovery();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        let stale = store.get_state("stale").await.unwrap().unwrap();
        assert_eq!(stale.status, ExecutionStatus::Failed);
        let fresh = store.get_state("fresh").await.unwrap().unwrap();
        assert_eq!(fresh.status, ExecutionStatus::InFlight);
    }
}
