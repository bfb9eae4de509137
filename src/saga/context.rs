use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Per-step execution state
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
    /// Persisted once a completed step has been undone
    Compensated,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Failed | StepStatus::Compensated)
    }
}

/// Typed name of a context variable
///
/// ```rust,ignore
/// const ORDER_ID: ContextKey<String> = ContextKey::new("order_id");
///
/// ctx.put(&ORDER_ID, "o-42".to_string())?;
/// let id: Option<String> = ctx.get(&ORDER_ID);
/// ```
pub struct ContextKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ContextKey<T> {}

/// Mutable state of one saga execution.
///
/// Created by the engine at execution start and shared (behind an `Arc`)
/// only between the tasks of that execution. Steps of one layer record into
/// it concurrently, so every map is a `DashMap`.
#[derive(Debug)]
pub struct SagaContext {
    correlation_id: String,
    saga_name: String,
    input: Value,
    headers: DashMap<String, String>,
    variables: DashMap<String, Value>,
    step_inputs: DashMap<String, Value>,
    results: DashMap<String, Value>,
    statuses: DashMap<String, StepStatus>,
    attempts: DashMap<String, u32>,
    latencies_ms: DashMap<String, u64>,
    started_at: DashMap<String, DateTime<Utc>>,
    errors: DashMap<String, String>,
    compensation_results: DashMap<String, Value>,
    compensation_errors: DashMap<String, String>,
    compensated: DashMap<String, u64>,
    compensation_seq: AtomicU64,
    idempotency_keys: DashSet<String>,
    layers: Vec<Vec<String>>,
    step_dependencies: HashMap<String, Vec<String>>,
}

impl SagaContext {
    pub fn new(saga_name: impl Into<String>, input: Value) -> Self {
        Self::with_correlation_id(saga_name, Uuid::new_v4().to_string(), input)
    }

    pub fn with_correlation_id(
        saga_name: impl Into<String>,
        correlation_id: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            saga_name: saga_name.into(),
            input,
            headers: DashMap::new(),
            variables: DashMap::new(),
            step_inputs: DashMap::new(),
            results: DashMap::new(),
            statuses: DashMap::new(),
            attempts: DashMap::new(),
            latencies_ms: DashMap::new(),
            started_at: DashMap::new(),
            errors: DashMap::new(),
            compensation_results: DashMap::new(),
            compensation_errors: DashMap::new(),
            compensated: DashMap::new(),
            compensation_seq: AtomicU64::new(0),
            idempotency_keys: DashSet::new(),
            layers: Vec::new(),
            step_dependencies: HashMap::new(),
        }
    }

    /// Attach the resolved topology and mark every step `PENDING`
    pub fn with_topology(
        mut self,
        layers: Vec<Vec<String>>,
        step_dependencies: HashMap<String, Vec<String>>,
    ) -> Self {
        for id in layers.iter().flatten() {
            self.statuses.insert(id.clone(), StepStatus::Pending);
        }
        self.layers = layers;
        self.step_dependencies = step_dependencies;
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn saga_name(&self) -> &str {
        &self.saga_name
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    pub fn step_dependencies(&self) -> &HashMap<String, Vec<String>> {
        &self.step_dependencies
    }

    // ----- headers & variables -----

    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.get(name).map(|v| v.clone())
    }

    pub fn headers(&self) -> HashMap<String, String> {
        self.headers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name).map(|v| v.clone())
    }

    pub fn variables(&self) -> HashMap<String, Value> {
        self.variables
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &ContextKey<T>) -> Option<T> {
        self.variable(key.name())
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn put<T: Serialize>(&self, key: &ContextKey<T>, value: T) -> serde_json::Result<()> {
        self.set_variable(key.name(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn set_step_input(&self, step_id: impl Into<String>, input: Value) {
        self.step_inputs.insert(step_id.into(), input);
    }

    pub fn step_input(&self, step_id: &str) -> Option<Value> {
        self.step_inputs.get(step_id).map(|v| v.clone())
    }

    // ----- forward progress -----

    pub fn status(&self, step_id: &str) -> StepStatus {
        self.statuses
            .get(step_id)
            .map(|s| *s)
            .unwrap_or(StepStatus::Pending)
    }

    pub fn result(&self, step_id: &str) -> Option<Value> {
        self.results.get(step_id).map(|v| v.clone())
    }

    pub fn error(&self, step_id: &str) -> Option<String> {
        self.errors.get(step_id).map(|v| v.clone())
    }

    pub fn attempts(&self, step_id: &str) -> u32 {
        self.attempts.get(step_id).map(|v| *v).unwrap_or(0)
    }

    pub fn latency_ms(&self, step_id: &str) -> u64 {
        self.latencies_ms.get(step_id).map(|v| *v).unwrap_or(0)
    }

    pub fn started_at(&self, step_id: &str) -> Option<DateTime<Utc>> {
        self.started_at.get(step_id).map(|v| *v)
    }

    pub(crate) fn mark_running(&self, step_id: &str) {
        self.statuses.insert(step_id.to_string(), StepStatus::Running);
        self.started_at.insert(step_id.to_string(), Utc::now());
    }

    pub(crate) fn set_attempts(&self, step_id: &str, attempts: u32) {
        self.attempts.insert(step_id.to_string(), attempts);
    }

    pub(crate) fn record_success(&self, step_id: &str, result: Value, latency_ms: u64) {
        self.results.insert(step_id.to_string(), result);
        self.latencies_ms.insert(step_id.to_string(), latency_ms);
        self.errors.remove(step_id);
        self.statuses.insert(step_id.to_string(), StepStatus::Done);
    }

    pub(crate) fn record_failure(&self, step_id: &str, error: String, latency_ms: u64) {
        self.errors.insert(step_id.to_string(), error);
        self.latencies_ms.insert(step_id.to_string(), latency_ms);
        self.statuses.insert(step_id.to_string(), StepStatus::Failed);
    }

    /// Steps currently `DONE`, in no particular order
    pub fn completed_steps(&self) -> Vec<String> {
        self.statuses
            .iter()
            .filter(|e| *e.value() == StepStatus::Done)
            .map(|e| e.key().clone())
            .collect()
    }

    // ----- idempotency -----

    pub fn has_idempotency_key(&self, key: &str) -> bool {
        self.idempotency_keys.contains(key)
    }

    /// Returns `false` if the key was already recorded
    pub fn record_idempotency_key(&self, key: impl Into<String>) -> bool {
        self.idempotency_keys.insert(key.into())
    }

    pub(crate) fn release_idempotency_key(&self, key: &str) {
        self.idempotency_keys.remove(key);
    }

    pub fn idempotency_keys(&self) -> Vec<String> {
        self.idempotency_keys.iter().map(|k| k.clone()).collect()
    }

    /// Render `{placeholder}` segments of an idempotency key template.
    ///
    /// Recognized: `correlation_id`, `saga`, `input`, `input.<field>`,
    /// `var.<name>`, `header.<name>`, `step.<id>`, and a bare variable name.
    /// Anything unresolved renders as an empty string.
    pub fn render_template(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    out.push_str(&self.lookup_placeholder(after[..close].trim()));
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn lookup_placeholder(&self, name: &str) -> String {
        let value = match name {
            "correlation_id" => return self.correlation_id.clone(),
            "saga" => return self.saga_name.clone(),
            "input" => Some(self.input.clone()),
            _ => match name.split_once('.') {
                Some(("input", field)) => self.input.get(field).cloned(),
                Some(("var", var)) => self.variable(var),
                Some(("header", header)) => return self.header(header).unwrap_or_default(),
                Some(("step", step)) => self.result(step),
                _ => self.variable(name),
            },
        };
        match value {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    // ----- compensation -----

    pub(crate) fn record_compensation_result(&self, step_id: &str, result: Value) {
        self.compensation_results.insert(step_id.to_string(), result);
        self.compensation_errors.remove(step_id);
        let seq = self.compensation_seq.fetch_add(1, Ordering::SeqCst);
        self.compensated.insert(step_id.to_string(), seq);
    }

    pub(crate) fn record_compensation_error(&self, step_id: &str, error: String) {
        self.compensation_errors.insert(step_id.to_string(), error);
    }

    pub fn compensation_result(&self, step_id: &str) -> Option<Value> {
        self.compensation_results.get(step_id).map(|v| v.clone())
    }

    pub fn compensation_error(&self, step_id: &str) -> Option<String> {
        self.compensation_errors.get(step_id).map(|v| v.clone())
    }

    pub fn is_compensated(&self, step_id: &str) -> bool {
        self.compensated.contains_key(step_id)
    }

    /// Successfully compensated steps in the order their compensation finished
    pub fn compensation_order(&self) -> Vec<String> {
        let mut order: Vec<(u64, String)> = self
            .compensated
            .iter()
            .map(|e| (*e.value(), e.key().clone()))
            .collect();
        order.sort();
        order.into_iter().map(|(_, id)| id).collect()
    }

    /// Every step id known to this execution
    pub fn step_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.statuses.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ORDER_ID: ContextKey<String> = ContextKey::new("order_id");
    const QUANTITY: ContextKey<u32> = ContextKey::new("quantity");

    #[test]
    fn test_typed_keys() {
        let ctx = SagaContext::new("order", Value::Null);
        ctx.put(&ORDER_ID, "o-1".to_string()).unwrap();
        ctx.put(&QUANTITY, 3).unwrap();

        assert_eq!(ctx.get(&ORDER_ID), Some("o-1".to_string()));
        assert_eq!(ctx.get(&QUANTITY), Some(3));
        assert_eq!(ctx.variable("order_id"), Some(json!("o-1")));
    }

    #[test]
    fn test_typed_key_mismatch_reads_none() {
        let ctx = SagaContext::new("order", Value::Null);
        ctx.set_variable("quantity", json!("three"));
        assert_eq!(ctx.get(&QUANTITY), None);
    }

    #[test]
    fn test_topology_marks_pending() {
        let ctx = SagaContext::new("order", Value::Null).with_topology(
            vec![vec!["a".into()], vec!["b".into()]],
            HashMap::from([("a".into(), vec![]), ("b".into(), vec!["a".into()])]),
        );
        assert_eq!(ctx.status("a"), StepStatus::Pending);
        assert_eq!(ctx.step_ids(), vec!["a", "b"]);
        assert_eq!(ctx.layers().len(), 2);
    }

    #[test]
    fn test_render_template() {
        let ctx = SagaContext::with_correlation_id(
            "order",
            "c-9",
            json!({ "order_id": "o-7", "amount": 100 }),
        );
        ctx.set_header("tenant", "acme");
        ctx.set_variable("sku", json!("sku-1"));
        ctx.record_success("reserve", json!({ "ok": true }), 1);

        assert_eq!(
            ctx.render_template("charge:{input.order_id}:{input.amount}"),
            "charge:o-7:100"
        );
        assert_eq!(
            ctx.render_template("{saga}/{correlation_id}/{header.tenant}"),
            "order/c-9/acme"
        );
        assert_eq!(ctx.render_template("{var.sku}-{sku}"), "sku-1-sku-1");
        assert_eq!(ctx.render_template("{step.reserve}"), r#"{"ok":true}"#);
        assert_eq!(ctx.render_template("x{missing}y"), "xy");
        assert_eq!(ctx.render_template("open{brace"), "open{brace");
    }

    #[test]
    fn test_idempotency_keys() {
        let ctx = SagaContext::new("order", Value::Null);
        assert!(ctx.record_idempotency_key("k1"));
        assert!(!ctx.record_idempotency_key("k1"));
        assert!(ctx.has_idempotency_key("k1"));
    }

    #[test]
    fn test_compensation_order_follows_recording() {
        let ctx = SagaContext::new("order", Value::Null);
        ctx.record_compensation_result("c", json!(1));
        ctx.record_compensation_result("a", json!(2));
        ctx.record_compensation_error("b", "nope".into());
        assert_eq!(ctx.compensation_order(), vec!["c", "a"]);
        assert!(!ctx.is_compensated("b"));
        assert_eq!(ctx.compensation_error("b").as_deref(), Some("nope"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(StepStatus::Done.to_string(), "DONE");
        assert_eq!("FAILED".parse::<StepStatus>().unwrap(), StepStatus::Failed);
    }
}
