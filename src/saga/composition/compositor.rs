use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;

use super::{CompositionContext, CompositionResult, DataFlowManager, SagaComposition};
use crate::error::{Result, SagaError};
use crate::saga::engine::{ExecuteOptions, SagaEngine};

/// Runs compositions on a [`SagaEngine`]
#[derive(Clone)]
pub struct SagaCompositor {
    engine: Arc<SagaEngine>,
}

impl SagaCompositor {
    pub fn new(engine: Arc<SagaEngine>) -> Self {
        Self { engine }
    }

    /// Execute every entry of `composition` in layer order.
    ///
    /// Entries of one layer run concurrently. Once an entry fails, no further
    /// layer is started and the remaining entries are reported as skipped.
    /// `Err` means the composition could not run at all: every entry's saga
    /// must be registered before the first one starts.
    pub async fn execute(&self, composition: &SagaComposition, input: Value) -> Result<CompositionResult> {
        if let Some(entry) = composition
            .entries
            .values()
            .find(|entry| !self.engine.registry().contains(&entry.saga_name))
        {
            tracing::error!(
                "Composition {} entry {} names unregistered saga {}",
                composition.name,
                entry.name,
                entry.saga_name
            );
            return Err(SagaError::UnknownSaga {
                name: entry.saga_name.clone(),
            });
        }

        tracing::info!(
            "Executing composition {} ({} entries)",
            composition.name,
            composition.entries.len()
        );

        let mut ctx = CompositionContext::new();
        let mut results = BTreeMap::new();
        let mut failed_entries = Vec::new();
        let mut skipped_entries = Vec::new();

        for layer in composition.layers() {
            if !failed_entries.is_empty() {
                skipped_entries.extend(layer.iter().cloned());
                continue;
            }

            let mut set = JoinSet::new();
            let mut tasks = HashMap::new();
            for name in layer {
                let Some(entry) = composition.entry(name) else {
                    continue;
                };
                let entry_input = DataFlowManager::resolve_input(entry, &ctx, &input);
                let mut options = ExecuteOptions::new()
                    .header("composition", composition.name.clone())
                    .header("composition-entry", entry.name.clone());
                if let Some(policy) = composition.compensation_policy {
                    options = options.compensation_policy(policy);
                }

                let engine = Arc::clone(&self.engine);
                let name = entry.name.clone();
                let saga_name = entry.saga_name.clone();
                let handle = set.spawn(async move {
                    let outcome = engine.execute_with(&saga_name, entry_input, options).await;
                    (name, outcome)
                });
                tasks.insert(handle.id(), entry.name.clone());
            }

            let mut first_error = None;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((name, Ok(result))) => {
                        if !result.success {
                            failed_entries.push(name.clone());
                        }
                        ctx.insert(name.clone(), result.clone());
                        results.insert(name, result);
                    }
                    Ok((name, Err(e))) => {
                        tracing::error!("Composition entry {} could not run: {}", name, e);
                        first_error.get_or_insert(e);
                    }
                    Err(e) => match tasks.get(&e.id()) {
                        Some(name) => {
                            tracing::error!("Composition entry {} task aborted: {}", name, e);
                            failed_entries.push(name.clone());
                        }
                        None => tracing::error!("Composition entry task aborted: {}", e),
                    },
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        failed_entries.sort();
        skipped_entries.sort();
        let success = failed_entries.is_empty() && skipped_entries.is_empty();
        if success {
            tracing::info!("Composition {} completed", composition.name);
        } else {
            tracing::warn!(
                "Composition {} failed: failed {:?}, skipped {:?}",
                composition.name,
                failed_entries,
                skipped_entries
            );
        }

        Ok(CompositionResult {
            name: composition.name.clone(),
            success,
            results,
            failed_entries,
            skipped_entries,
        })
    }
}
