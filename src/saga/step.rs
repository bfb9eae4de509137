use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::context::ContextKey;
use super::invoker::{Arguments, Param};

/// Asynchronous step or compensation logic
///
/// Implemented for every `Fn(Arguments) -> impl Future<Output = anyhow::Result<Value>>`,
/// so plain async closures can be used directly.
#[async_trait]
pub trait StepAction: Send + Sync + 'static {
    async fn invoke(&self, args: Arguments) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> StepAction for F
where
    F: Fn(Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn invoke(&self, args: Arguments) -> anyhow::Result<Value> {
        (self)(args).await
    }
}

pub type BlockingFn = dyn Fn(Arguments) -> anyhow::Result<Value> + Send + Sync + 'static;

/// A callable reference, either awaited inline or run on the worker pool
#[derive(Clone)]
pub enum Action {
    Async(Arc<dyn StepAction>),
    Blocking(Arc<BlockingFn>),
}

impl Action {
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Action::Async(Arc::new(f))
    }

    pub fn from_step_action<A: StepAction>(action: A) -> Self {
        Action::Async(Arc::new(action))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(Arguments) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Action::Blocking(Arc::new(f))
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Action::Blocking(_))
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Async(_) => f.write_str("Action::Async"),
            Action::Blocking(_) => f.write_str("Action::Blocking"),
        }
    }
}

/// How a step names its compensation
#[derive(Clone, Debug)]
pub enum CompensationRef {
    Direct(Action),
    /// Resolved against the saga's handler table at registration
    Named(String),
}

/// Declaration of a single step, consumed by [`SagaRegistry::register`](super::SagaRegistry::register)
///
/// # Example
///
/// ```rust,ignore
/// let charge = StepDescriptor::new("charge-payment", |args: Arguments| async move {
///     let amount: u64 = args.get(0)?;
///     Ok(json!({ "charged": amount }))
/// })
/// .params([Param::InputField("amount".into())])
/// .depends_on(["reserve-inventory"])
/// .retry(2)
/// .backoff_ms(50)
/// .compensate_named("refund");
/// ```
#[derive(Clone, Debug)]
pub struct StepDescriptor {
    pub(crate) id: String,
    pub(crate) action: Action,
    pub(crate) params: Vec<Param>,
    pub(crate) compensation: Option<CompensationRef>,
    pub(crate) compensation_params: Vec<Param>,
    pub(crate) depends_on: Vec<String>,
    pub(crate) retry: u32,
    pub(crate) backoff_ms: u64,
    pub(crate) jitter: Option<f64>,
    pub(crate) timeout_ms: u64,
    pub(crate) idempotency_key: Option<String>,
    pub(crate) compensation_retry: Option<u32>,
    pub(crate) compensation_backoff_ms: Option<u64>,
    pub(crate) compensation_timeout_ms: Option<u64>,
    pub(crate) compensation_critical: bool,
    pub(crate) outputs: Vec<String>,
}

impl StepDescriptor {
    /// Step whose forward action is awaited on the orchestration runtime
    pub fn new<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::with_action(id, Action::from_fn(f))
    }

    /// CPU-bound step whose forward action runs on the worker pool
    pub fn blocking<F>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arguments) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::with_action(id, Action::blocking(f))
    }

    pub fn with_action(id: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into(),
            action,
            params: Vec::new(),
            compensation: None,
            compensation_params: Vec::new(),
            depends_on: Vec::new(),
            retry: 0,
            backoff_ms: 0,
            jitter: None,
            timeout_ms: 0,
            idempotency_key: None,
            compensation_retry: None,
            compensation_backoff_ms: None,
            compensation_timeout_ms: None,
            compensation_critical: false,
            outputs: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Parameters resolved for the forward action. Defaults to `[Param::Input]`.
    pub fn params<I: IntoIterator<Item = Param>>(mut self, params: I) -> Self {
        self.params = params.into_iter().collect();
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    /// Randomize each backoff delay by up to `±factor` of its value
    pub fn jitter(mut self, factor: f64) -> Self {
        self.jitter = Some(factor.clamp(0.0, 1.0));
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Template such as `"charge:{input.order_id}"`
    pub fn idempotency_key(mut self, template: impl Into<String>) -> Self {
        self.idempotency_key = Some(template.into());
        self
    }

    pub fn compensate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.compensation = Some(CompensationRef::Direct(Action::from_fn(f)));
        self
    }

    pub fn compensate_with(mut self, action: Action) -> Self {
        self.compensation = Some(CompensationRef::Direct(action));
        self
    }

    pub fn compensate_blocking<F>(mut self, f: F) -> Self
    where
        F: Fn(Arguments) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.compensation = Some(CompensationRef::Direct(Action::blocking(f)));
        self
    }

    pub fn compensate_named(mut self, handler: impl Into<String>) -> Self {
        self.compensation = Some(CompensationRef::Named(handler.into()));
        self
    }

    /// Parameters resolved for the compensation. Defaults to the step's own result.
    pub fn compensation_params<I: IntoIterator<Item = Param>>(mut self, params: I) -> Self {
        self.compensation_params = params.into_iter().collect();
        self
    }

    pub fn compensation_retry(mut self, retry: u32) -> Self {
        self.compensation_retry = Some(retry);
        self
    }

    pub fn compensation_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.compensation_backoff_ms = Some(backoff_ms);
        self
    }

    pub fn compensation_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.compensation_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn compensation_critical(mut self, critical: bool) -> Self {
        self.compensation_critical = critical;
        self
    }

    /// Store the step's result under the context variable `name`
    pub fn set_variable(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn bind<T>(self, key: &ContextKey<T>) -> Self {
        self.set_variable(key.name())
    }
}

/// Validated, immutable step metadata
#[derive(Clone, Debug)]
pub struct StepDefinition {
    pub id: String,
    pub action: Action,
    pub params: Vec<Param>,
    pub compensation: Option<Action>,
    /// Handler name when the compensation was declared by name
    pub compensation_name: Option<String>,
    pub compensation_params: Vec<Param>,
    pub depends_on: Vec<String>,
    pub retry: u32,
    pub backoff_ms: u64,
    pub jitter: Option<f64>,
    pub timeout_ms: u64,
    pub cpu_bound: bool,
    pub idempotency_key: Option<String>,
    pub compensation_retry: Option<u32>,
    pub compensation_backoff_ms: Option<u64>,
    pub compensation_timeout_ms: Option<u64>,
    pub compensation_critical: bool,
    pub outputs: Vec<String>,
}

impl StepDefinition {
    pub(crate) fn from_descriptor(
        descriptor: StepDescriptor,
        compensation: Option<Action>,
        compensation_name: Option<String>,
    ) -> Self {
        let params = if descriptor.params.is_empty() {
            vec![Param::Input]
        } else {
            descriptor.params
        };
        let compensation_params = if descriptor.compensation_params.is_empty() {
            vec![Param::StepResult(descriptor.id.clone())]
        } else {
            descriptor.compensation_params
        };
        let mut depends_on = descriptor.depends_on;
        depends_on.sort();
        depends_on.dedup();

        Self {
            cpu_bound: descriptor.action.is_blocking(),
            id: descriptor.id,
            action: descriptor.action,
            params,
            compensation,
            compensation_name,
            compensation_params,
            depends_on,
            retry: descriptor.retry,
            backoff_ms: descriptor.backoff_ms,
            jitter: descriptor.jitter,
            timeout_ms: descriptor.timeout_ms,
            idempotency_key: descriptor.idempotency_key,
            compensation_retry: descriptor.compensation_retry,
            compensation_backoff_ms: descriptor.compensation_backoff_ms,
            compensation_timeout_ms: descriptor.compensation_timeout_ms,
            compensation_critical: descriptor.compensation_critical,
            outputs: descriptor.outputs,
        }
    }

    pub fn has_compensation(&self) -> bool {
        self.compensation.is_some()
    }

    pub fn effective_compensation_retry(&self) -> u32 {
        self.compensation_retry.unwrap_or(self.retry)
    }

    pub fn effective_compensation_backoff_ms(&self) -> u64 {
        self.compensation_backoff_ms.unwrap_or(self.backoff_ms)
    }

    pub fn effective_compensation_timeout_ms(&self) -> u64 {
        self.compensation_timeout_ms.unwrap_or(self.timeout_ms)
    }
}

/// Delay before the retry that follows failed attempt `attempt` (0-based):
/// `base_ms * 2^attempt`, optionally spread by `±jitter`.
pub(crate) fn backoff_delay(base_ms: u64, attempt: u32, jitter: Option<f64>) -> Duration {
    let exp = base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let delay = match jitter {
        Some(factor) if factor > 0.0 && exp > 0 => {
            use rand::Rng;
            let spread = rand::thread_rng().gen_range(-factor..=factor);
            ((exp as f64) * (1.0 + spread)).max(0.0) as u64
        }
        _ => exp,
    };
    Duration::from_millis(delay)
}
