use std::collections::BTreeMap;

use super::{CompositionEntry, SagaComposition};
use crate::error::{Result, SagaError};
use crate::saga::topology::{self, TopologyError};

/// Structural checks run before a composition can be used
pub struct CompositionValidator;

impl CompositionValidator {
    /// Check references and acyclicity, returning the entry layers.
    pub fn validate(name: &str, entries: &BTreeMap<String, CompositionEntry>) -> Result<Vec<Vec<String>>> {
        if entries.is_empty() {
            return Err(SagaError::invalid_composition(name, "composition has no entries"));
        }

        for entry in entries.values() {
            if let Some(missing) = entry.depends_on.iter().find(|d| !entries.contains_key(*d)) {
                return Err(SagaError::invalid_composition(
                    name,
                    format!("entry '{}' depends on unknown entry '{}'", entry.name, missing),
                ));
            }
            if let Some(flow) = entry
                .data_flows
                .iter()
                .find(|f| !entries.contains_key(&f.source_saga))
            {
                return Err(SagaError::invalid_composition(
                    name,
                    format!(
                        "entry '{}' reads from unknown entry '{}'",
                        entry.name, flow.source_saga
                    ),
                ));
            }
        }

        topology::compute_layers(&SagaComposition::dependency_map(entries)).map_err(|e| match e {
            TopologyError::CycleDetected { remaining } => SagaError::invalid_composition(
                name,
                format!("dependency cycle among {}", remaining.join(", ")),
            ),
            other => SagaError::invalid_composition(name, other.to_string()),
        })
    }
}
