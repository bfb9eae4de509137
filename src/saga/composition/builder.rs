use std::collections::BTreeMap;

use super::{CompositionEntry, CompositionValidator, DataFlow, SagaComposition};
use crate::error::{Result, SagaError};
use crate::saga::compensator::CompensationPolicy;

/// Fluent assembly of a [`SagaComposition`]
///
/// `depends_on` and `data_flow` apply to the entry added last.
///
/// # Example
///
/// ```rust,ignore
/// let composition = SagaCompositionBuilder::new("checkout")
///     .saga("create-order")
///     .saga("charge")
///     .depends_on(["create-order"])
///     .data_flow(DataFlow::from_saga("create-order").step("persist").into_key("order_id"))
///     .build()?;
/// ```
pub struct SagaCompositionBuilder {
    name: String,
    entries: Vec<CompositionEntry>,
    compensation_policy: Option<CompensationPolicy>,
    /// First misuse seen while chaining, reported by `build`
    error: Option<String>,
}

impl SagaCompositionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
            compensation_policy: None,
            error: None,
        }
    }

    /// Add an entry running `saga_name`, named after it
    pub fn saga(self, saga_name: impl Into<String>) -> Self {
        self.entry(CompositionEntry::new(saga_name))
    }

    pub fn entry(mut self, entry: CompositionEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn depends_on<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self.entries.last_mut() {
            Some(last) => last.depends_on.extend(entries.into_iter().map(Into::into)),
            None => self.misuse("depends_on called before any entry"),
        }
        self
    }

    pub fn data_flow(mut self, flow: DataFlow) -> Self {
        match self.entries.last_mut() {
            Some(last) => last.data_flows.push(flow),
            None => self.misuse("data_flow called before any entry"),
        }
        self
    }

    pub fn compensation_policy(mut self, policy: CompensationPolicy) -> Self {
        self.compensation_policy = Some(policy);
        self
    }

    fn misuse(&mut self, message: &str) {
        self.error.get_or_insert_with(|| message.to_string());
    }

    pub fn build(self) -> Result<SagaComposition> {
        if let Some(message) = self.error {
            return Err(SagaError::invalid_composition(&self.name, message));
        }
        if self.entries.is_empty() {
            return Err(SagaError::invalid_composition(&self.name, "composition has no entries"));
        }

        let mut entries = BTreeMap::new();
        for entry in self.entries {
            if entries.contains_key(&entry.name) {
                return Err(SagaError::invalid_composition(
                    &self.name,
                    format!("entry '{}' declared more than once", entry.name),
                ));
            }
            entries.insert(entry.name.clone(), entry);
        }

        let layers = CompositionValidator::validate(&self.name, &entries)?;
        tracing::debug!(
            "Built composition {} ({} entries in {} layers)",
            self.name,
            entries.len(),
            layers.len()
        );

        Ok(SagaComposition {
            name: self.name,
            entries,
            compensation_policy: self.compensation_policy,
            layers,
        })
    }
}
