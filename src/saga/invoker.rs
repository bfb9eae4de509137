//! Argument resolution and the two invocation lanes
//!
//! Async actions run on a spawned tokio task so that a panic is contained and
//! a timed-out attempt can be aborted. Blocking actions are handed to the
//! [`WorkerPool`]; a timed-out blocking attempt stops being awaited but the
//! pool thread runs it to completion.

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

use super::context::SagaContext;
use super::step::{Action, StepDefinition};
use crate::error::StepError;
use crate::worker::WorkerPool;

static NULL: Value = Value::Null;

/// What an action asks to receive, resolved positionally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    /// The whole input: the per-step input if one was supplied, else the saga input
    Input,
    /// One field of the input object
    InputField(String),
    Variable(String),
    StepResult(String),
    Header(String),
    CorrelationId,
    SagaName,
}

/// Resolved values handed to an action
#[derive(Debug, Clone)]
pub struct Arguments {
    step_id: String,
    correlation_id: String,
    values: Vec<Value>,
}

impl Arguments {
    pub fn new(step_id: impl Into<String>, correlation_id: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            step_id: step_id.into(),
            correlation_id: correlation_id.into(),
            values,
        }
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value at `index`; `Null` when out of range
    pub fn value(&self, index: usize) -> &Value {
        self.values.get(index).unwrap_or(&NULL)
    }

    pub fn get<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        serde_json::from_value(self.value(index).clone()).with_context(|| {
            format!(
                "argument {} of step '{}' has an unexpected shape",
                index, self.step_id
            )
        })
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

pub struct ArgumentResolver;

impl ArgumentResolver {
    /// Resolve `params` against `ctx`.
    ///
    /// `step_input` only feeds [`Param::Input`]/[`Param::InputField`]; pass
    /// `None` to bind the saga-level input instead.
    pub fn resolve(
        params: &[Param],
        ctx: &SagaContext,
        step_id: &str,
        step_input: Option<&Value>,
    ) -> Arguments {
        let input = step_input.unwrap_or(ctx.input());
        let values = params
            .iter()
            .map(|param| match param {
                Param::Input => input.clone(),
                Param::InputField(field) => input.get(field).cloned().unwrap_or(Value::Null),
                Param::Variable(name) => ctx.variable(name).unwrap_or(Value::Null),
                Param::StepResult(id) => ctx.result(id).unwrap_or(Value::Null),
                Param::Header(name) => ctx.header(name).map(Value::String).unwrap_or(Value::Null),
                Param::CorrelationId => Value::String(ctx.correlation_id().to_string()),
                Param::SagaName => Value::String(ctx.saga_name().to_string()),
            })
            .collect();
        Arguments::new(step_id, ctx.correlation_id(), values)
    }
}

/// Invokes forward and compensation actions of a step
#[derive(Clone)]
pub struct StepInvoker {
    worker_pool: WorkerPool,
}

impl StepInvoker {
    pub fn new(worker_pool: WorkerPool) -> Self {
        Self { worker_pool }
    }

    /// Run one forward attempt and bind the result to the step's output variables
    pub async fn invoke_step(&self, step: &StepDefinition, ctx: &SagaContext) -> Result<Value, StepError> {
        let step_input = ctx.step_input(&step.id);
        let args = ArgumentResolver::resolve(&step.params, ctx, &step.id, step_input.as_ref());
        let value = self.call(&step.action, args, step.timeout_ms).await?;

        for name in &step.outputs {
            ctx.set_variable(name.clone(), value.clone());
        }
        Ok(value)
    }

    /// Run one compensation attempt. `None` when the step declares no compensation.
    pub async fn invoke_compensation(
        &self,
        step: &StepDefinition,
        ctx: &SagaContext,
        timeout_ms: u64,
    ) -> Option<Result<Value, StepError>> {
        let action = step.compensation.as_ref()?;
        let args = ArgumentResolver::resolve(&step.compensation_params, ctx, &step.id, None);
        Some(self.call(action, args, timeout_ms).await)
    }

    async fn call(&self, action: &Action, args: Arguments, timeout_ms: u64) -> Result<Value, StepError> {
        match action {
            Action::Async(action) => {
                let action = action.clone();
                let mut handle = tokio::spawn(async move { action.invoke(args).await });
                let joined = if timeout_ms > 0 {
                    match tokio::time::timeout(Duration::from_millis(timeout_ms), &mut handle).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            handle.abort();
                            return Err(StepError::TimedOut { timeout_ms });
                        }
                    }
                } else {
                    handle.await
                };
                match joined {
                    Ok(result) => result.map_err(StepError::from),
                    Err(e) if e.is_panic() => Err(StepError::Panicked(
                        crate::worker::panic_message(e.into_panic().as_ref()),
                    )),
                    Err(e) => Err(StepError::Failed(e.to_string())),
                }
            }
            Action::Blocking(f) => {
                let f = f.clone();
                let work = self.worker_pool.execute(move || (*f)(args));
                let result = if timeout_ms > 0 {
                    tokio::time::timeout(Duration::from_millis(timeout_ms), work)
                        .await
                        .map_err(|_| StepError::TimedOut { timeout_ms })?
                } else {
                    work.await
                };
                result?.map_err(StepError::from)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::step::StepDescriptor;
    use serde_json::json;

    fn invoker() -> StepInvoker {
        StepInvoker::new(WorkerPool::new(2).unwrap())
    }

    fn ctx() -> SagaContext {
        let ctx = SagaContext::with_correlation_id("order", "c-1", json!({ "amount": 100, "sku": "s-1" }));
        ctx.set_variable("customer", json!("alice"));
        ctx.set_header("trace-id", "t-1");
        ctx
    }

    #[test]
    fn test_resolve_params() {
        let ctx = ctx();
        ctx.record_success("reserve", json!({ "reservation": 5 }), 0);
        let args = ArgumentResolver::resolve(
            &[
                Param::Input,
                Param::InputField("amount".into()),
                Param::Variable("customer".into()),
                Param::StepResult("reserve".into()),
                Param::Header("trace-id".into()),
                Param::CorrelationId,
                Param::SagaName,
                Param::Variable("missing".into()),
            ],
            &ctx,
            "charge",
            None,
        );

        assert_eq!(args.len(), 8);
        assert_eq!(args.value(0), &json!({ "amount": 100, "sku": "s-1" }));
        assert_eq!(args.get::<u64>(1).unwrap(), 100);
        assert_eq!(args.get::<String>(2).unwrap(), "alice");
        assert_eq!(args.value(3)["reservation"], json!(5));
        assert_eq!(args.value(4), &json!("t-1"));
        assert_eq!(args.value(5), &json!("c-1"));
        assert_eq!(args.value(6), &json!("order"));
        assert_eq!(args.value(7), &Value::Null);
        assert_eq!(args.value(99), &Value::Null);
        assert!(args.get::<u64>(2).is_err());
    }

    #[test]
    fn test_step_input_overrides_saga_input() {
        let ctx = ctx();
        let step_input = json!({ "amount": 7 });
        let args = ArgumentResolver::resolve(
            &[Param::InputField("amount".into())],
            &ctx,
            "charge",
            Some(&step_input),
        );
        assert_eq!(args.get::<u64>(0).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_invoke_binds_outputs() {
        let ctx = ctx();
        let descriptor = StepDescriptor::new("reserve", |args: Arguments| async move {
            let amount: u64 = args.get(0)?;
            Ok(json!(amount * 2))
        })
        .params([Param::InputField("amount".into())])
        .set_variable("doubled");
        let step = StepDefinition::from_descriptor(descriptor, None, None);

        let value = invoker().invoke_step(&step, &ctx).await.unwrap();
        assert_eq!(value, json!(200));
        assert_eq!(ctx.variable("doubled"), Some(json!(200)));
    }

    #[tokio::test]
    async fn test_invoke_uses_per_step_input() {
        let ctx = ctx();
        ctx.set_step_input("reserve", json!({ "amount": 1 }));
        let descriptor = StepDescriptor::new("reserve", |args: Arguments| async move {
            Ok(args.value(0)["amount"].clone())
        });
        let step = StepDefinition::from_descriptor(descriptor, None, None);
        assert_eq!(invoker().invoke_step(&step, &ctx).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_blocking_lane() {
        let ctx = ctx();
        let descriptor = StepDescriptor::blocking("checksum", |args: Arguments| {
            let sku: String = args.get(0)?;
            Ok(json!(sku.len()))
        })
        .params([Param::InputField("sku".into())]);
        let step = StepDefinition::from_descriptor(descriptor, None, None);
        assert!(step.cpu_bound);
        assert_eq!(invoker().invoke_step(&step, &ctx).await.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_timeout() {
        let ctx = ctx();
        let descriptor = StepDescriptor::new("slow", |_args: Arguments| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(Value::Null)
        })
        .timeout_ms(20);
        let step = StepDefinition::from_descriptor(descriptor, None, None);
        let err = invoker().invoke_step(&step, &ctx).await.unwrap_err();
        assert_eq!(err, StepError::TimedOut { timeout_ms: 20 });
    }

    #[tokio::test]
    async fn test_error_and_panic_are_captured() {
        let ctx = ctx();
        let failing = StepDefinition::from_descriptor(
            StepDescriptor::new("fail", |_args: Arguments| async move {
                Err::<Value, _>(anyhow::anyhow!("card declined"))
            }),
            None,
            None,
        );
        assert_eq!(
            invoker().invoke_step(&failing, &ctx).await.unwrap_err(),
            StepError::Failed("card declined".into())
        );

        let panicking = StepDefinition::from_descriptor(
            StepDescriptor::new("panic", |_args: Arguments| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            }),
            None,
            None,
        );
        assert_eq!(
            invoker().invoke_step(&panicking, &ctx).await.unwrap_err(),
            StepError::Panicked("kaboom".into())
        );
    }

    #[tokio::test]
    async fn test_compensation_gets_own_result_not_step_input() {
        let ctx = ctx();
        ctx.set_step_input("reserve", json!({ "amount": 1 }));
        ctx.record_success("reserve", json!("r-9"), 0);
        let descriptor = StepDescriptor::new("reserve", |_args: Arguments| async move { Ok(Value::Null) })
            .compensate(|args: Arguments| async move { Ok(json!([args.value(0).clone()])) });
        let comp = descriptor.compensation.clone();
        let action = match comp {
            Some(crate::saga::step::CompensationRef::Direct(a)) => Some(a),
            _ => None,
        };
        let step = StepDefinition::from_descriptor(descriptor, action, None);

        let out = invoker().invoke_compensation(&step, &ctx, 0).await.unwrap().unwrap();
        assert_eq!(out, json!(["r-9"]));

        let with_input = StepDefinition {
            compensation_params: vec![Param::InputField("amount".into())],
            ..step
        };
        let out = invoker()
            .invoke_compensation(&with_input, &ctx, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, json!([100]));
    }

    #[tokio::test]
    async fn test_no_compensation_returns_none() {
        let ctx = ctx();
        let step = StepDefinition::from_descriptor(
            StepDescriptor::new("reserve", |_args: Arguments| async move { Ok(Value::Null) }),
            None,
            None,
        );
        assert!(invoker().invoke_compensation(&step, &ctx, 0).await.is_none());
    }
}
