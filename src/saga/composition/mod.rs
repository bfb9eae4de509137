//! Multi-saga workflows
//!
//! A [`SagaComposition`] is a DAG of entries, each running one registered
//! saga. Entries name the entries they depend on and may pull values out of
//! upstream results through [`DataFlow`] declarations. Compositions are
//! validated when built and executed by the [`SagaCompositor`].

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

mod builder;
mod compositor;
mod data_flow;
mod validator;

pub use builder::SagaCompositionBuilder;
pub use compositor::SagaCompositor;
pub use data_flow::DataFlowManager;
pub use validator::CompositionValidator;

use super::compensator::CompensationPolicy;
use super::result::SagaResult;

/// Moves a value from an upstream entry's result into an entry's input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFlow {
    /// Upstream entry name
    pub source_saga: String,
    /// Step whose result is taken; the whole `SagaResult` when absent
    pub source_step: Option<String>,
    /// Input key receiving the value; merged or keyed by source when absent
    pub target_key: Option<String>,
}

impl DataFlow {
    pub fn from_saga(source_saga: impl Into<String>) -> Self {
        Self {
            source_saga: source_saga.into(),
            source_step: None,
            target_key: None,
        }
    }

    pub fn step(mut self, step_id: impl Into<String>) -> Self {
        self.source_step = Some(step_id.into());
        self
    }

    pub fn into_key(mut self, key: impl Into<String>) -> Self {
        self.target_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositionEntry {
    /// Name of this entry within the composition
    pub name: String,
    /// Registered saga the entry runs
    pub saga_name: String,
    pub depends_on: Vec<String>,
    pub data_flows: Vec<DataFlow>,
}

impl CompositionEntry {
    /// Entry named after the saga it runs
    pub fn new(saga_name: impl Into<String>) -> Self {
        let saga_name = saga_name.into();
        Self {
            name: saga_name.clone(),
            saga_name,
            depends_on: Vec::new(),
            data_flows: Vec::new(),
        }
    }

    /// Entry running `saga_name` under a different name, for running one saga twice
    pub fn named(name: impl Into<String>, saga_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::new(saga_name)
        }
    }

    pub fn depends_on<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(entries.into_iter().map(Into::into));
        self
    }

    pub fn data_flow(mut self, flow: DataFlow) -> Self {
        self.data_flows.push(flow);
        self
    }
}

/// A validated DAG of saga entries
#[derive(Debug, Clone)]
pub struct SagaComposition {
    pub name: String,
    pub entries: BTreeMap<String, CompositionEntry>,
    /// Policy applied to every entry that fails
    pub compensation_policy: Option<CompensationPolicy>,
    pub(crate) layers: Vec<Vec<String>>,
}

impl SagaComposition {
    pub fn entry(&self, name: &str) -> Option<&CompositionEntry> {
        self.entries.get(name)
    }

    /// Entry names grouped into execution layers
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    pub(crate) fn dependency_map(entries: &BTreeMap<String, CompositionEntry>) -> HashMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.depends_on.clone()))
            .collect()
    }
}

/// Results of the entries completed so far in one composition run
#[derive(Debug, Default, Clone)]
pub struct CompositionContext {
    results: HashMap<String, SagaResult>,
}

impl CompositionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: impl Into<String>, result: SagaResult) {
        self.results.insert(entry.into(), result);
    }

    pub fn result(&self, entry: &str) -> Option<&SagaResult> {
        self.results.get(entry)
    }

    pub fn step_result(&self, entry: &str, step_id: &str) -> Option<&Value> {
        self.results.get(entry).and_then(|r| r.result_of(step_id))
    }
}

/// Outcome of executing a composition
#[derive(Debug, Clone)]
pub struct CompositionResult {
    pub name: String,
    pub success: bool,
    pub results: BTreeMap<String, SagaResult>,
    /// Entries whose saga failed, sorted
    pub failed_entries: Vec<String>,
    /// Entries never started because an earlier layer failed, sorted
    pub skipped_entries: Vec<String>,
}

impl CompositionResult {
    pub fn result(&self, entry: &str) -> Option<&SagaResult> {
        self.results.get(entry)
    }
}
