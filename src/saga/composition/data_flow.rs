use serde_json::{Map, Value};

use super::{CompositionContext, CompositionEntry};

/// Builds the input of a composition entry from upstream results
pub struct DataFlowManager;

impl DataFlowManager {
    /// Resolve the input for `entry`.
    ///
    /// Starts from `initial_input` when it is an object, else from an empty
    /// object. Each data flow takes the named step's result, or the whole
    /// upstream `SagaResult` when no step is named. With a target key the
    /// value is stored under it; otherwise an object value is merged in and
    /// anything else is stored under the upstream entry's name.
    pub fn resolve_input(entry: &CompositionEntry, ctx: &CompositionContext, initial_input: &Value) -> Value {
        let mut input = match initial_input {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };

        for flow in &entry.data_flows {
            let Some(upstream) = ctx.result(&flow.source_saga) else {
                tracing::warn!(
                    "Entry {} reads from {} which has no result",
                    entry.name,
                    flow.source_saga
                );
                continue;
            };

            let value = match &flow.source_step {
                Some(step) => upstream.result_of(step).cloned().unwrap_or(Value::Null),
                None => match serde_json::to_value(upstream) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::error!("Failed to serialize result of {}: {}", flow.source_saga, e);
                        Value::Null
                    }
                },
            };

            match (&flow.target_key, value) {
                (Some(key), value) => {
                    input.insert(key.clone(), value);
                }
                (None, Value::Object(map)) => input.extend(map),
                (None, value) => {
                    input.insert(flow.source_saga.clone(), value);
                }
            }
        }

        Value::Object(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::composition::DataFlow;
    use crate::saga::context::SagaContext;
    use crate::saga::result::SagaResult;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;

    fn upstream(results: &[(&str, Value)]) -> SagaResult {
        let ids: Vec<String> = results.iter().map(|(id, _)| id.to_string()).collect();
        let ctx = SagaContext::with_correlation_id("order", "c-1", Value::Null)
            .with_topology(vec![ids], HashMap::new());
        for (id, value) in results {
            ctx.record_success(id, value.clone(), 0);
        }
        SagaResult::from_context(&ctx, Utc::now(), true, None, None)
    }

    #[test]
    fn test_target_key_merge_and_fallback() {
        let mut ctx = CompositionContext::new();
        ctx.insert(
            "order",
            upstream(&[
                ("create", json!("o-9")),
                ("price", json!({ "amount": 100, "currency": "EUR" })),
            ]),
        );

        let entry = CompositionEntry::new("payment")
            .data_flow(DataFlow::from_saga("order").step("create").into_key("order_id"))
            .data_flow(DataFlow::from_saga("order").step("price"));
        let input = DataFlowManager::resolve_input(&entry, &ctx, &json!({ "customer": "alice" }));
        assert_eq!(
            input,
            json!({ "customer": "alice", "order_id": "o-9", "amount": 100, "currency": "EUR" })
        );

        let entry = CompositionEntry::new("audit")
            .data_flow(DataFlow::from_saga("order").step("create"));
        let input = DataFlowManager::resolve_input(&entry, &ctx, &json!("not an object"));
        assert_eq!(input, json!({ "order": "o-9" }));
    }

    #[test]
    fn test_whole_result_flow() {
        let mut ctx = CompositionContext::new();
        ctx.insert("order", upstream(&[("create", json!("o-9"))]));

        let entry = CompositionEntry::new("audit")
            .data_flow(DataFlow::from_saga("order").into_key("upstream"));
        let input = DataFlowManager::resolve_input(&entry, &ctx, &Value::Null);
        assert_eq!(input["upstream"]["correlation_id"], json!("c-1"));
        assert_eq!(input["upstream"]["steps"]["create"]["result"], json!("o-9"));
    }
}
