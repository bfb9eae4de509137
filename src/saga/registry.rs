use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use super::compensator::CompensationPolicy;
use super::invoker::Arguments;
use super::step::{Action, CompensationRef, StepDefinition, StepDescriptor};
use super::topology;
use crate::error::{Result, SagaError};

/// Everything needed to register one saga
///
/// `handlers` is the saga's table of named callables; steps that declare
/// their compensation by name are resolved against it.
///
/// # Example
///
/// ```rust,ignore
/// let declaration = SagaDeclaration::new("order-fulfillment")
///     .handler("refund", |args: Arguments| async move { Ok(json!("refunded")) })
///     .step(StepDescriptor::new("reserve-inventory", reserve))
///     .step(
///         StepDescriptor::new("charge-payment", charge)
///             .depends_on(["reserve-inventory"])
///             .compensate_named("refund"),
///     );
/// registry.register(declaration)?;
/// ```
#[derive(Clone, Debug)]
pub struct SagaDeclaration {
    name: String,
    steps: Vec<StepDescriptor>,
    handlers: HashMap<String, Action>,
    layer_concurrency: Option<usize>,
    compensation_policy: Option<CompensationPolicy>,
}

impl SagaDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            handlers: HashMap::new(),
            layer_concurrency: None,
            compensation_policy: None,
        }
    }

    pub fn step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps<I: IntoIterator<Item = StepDescriptor>>(mut self, steps: I) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn handler<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.handler_action(name, Action::from_fn(f))
    }

    pub fn handler_action(mut self, name: impl Into<String>, action: Action) -> Self {
        self.handlers.insert(name.into(), action);
        self
    }

    /// Maximum steps of one layer running at once
    pub fn layer_concurrency(mut self, limit: usize) -> Self {
        self.layer_concurrency = Some(limit.max(1));
        self
    }

    pub fn compensation_policy(mut self, policy: CompensationPolicy) -> Self {
        self.compensation_policy = Some(policy);
        self
    }
}

/// A validated saga
#[derive(Debug)]
pub struct SagaDefinition {
    pub name: String,
    pub steps: BTreeMap<String, Arc<StepDefinition>>,
    /// Execution layers computed once at registration
    pub layers: Vec<Vec<String>>,
    pub layer_concurrency: Option<usize>,
    pub compensation_policy: Option<CompensationPolicy>,
}

impl SagaDefinition {
    pub fn step(&self, id: &str) -> Option<&Arc<StepDefinition>> {
        self.steps.get(id)
    }

    pub fn dependency_map(&self) -> HashMap<String, Vec<String>> {
        self.steps
            .iter()
            .map(|(id, step)| (id.clone(), step.depends_on.clone()))
            .collect()
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &String> {
        self.steps.keys()
    }
}

/// Validates and stores saga definitions
#[derive(Default)]
pub struct SagaRegistry {
    sagas: DashMap<String, Arc<SagaDefinition>>,
}

impl SagaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `declaration` and store the resulting definition.
    ///
    /// Fails on duplicate saga or step ids, a `depends_on` naming an
    /// undeclared step, a named compensation missing from the handler table,
    /// or a dependency cycle.
    pub fn register(&self, declaration: SagaDeclaration) -> Result<Arc<SagaDefinition>> {
        let SagaDeclaration {
            name,
            steps: descriptors,
            handlers,
            layer_concurrency,
            compensation_policy,
        } = declaration;

        if self.sagas.contains_key(&name) {
            return Err(SagaError::DuplicateSaga { name });
        }
        if descriptors.is_empty() {
            return Err(SagaError::EmptySaga { saga: name });
        }

        let mut steps = BTreeMap::new();
        for mut descriptor in descriptors {
            if steps.contains_key(&descriptor.id) {
                return Err(SagaError::DuplicateStep {
                    saga: name,
                    step: descriptor.id,
                });
            }
            let (compensation, compensation_name) = match descriptor.compensation.take() {
                None => (None, None),
                Some(CompensationRef::Direct(action)) => (Some(action), None),
                Some(CompensationRef::Named(handler)) => match handlers.get(&handler) {
                    Some(action) => (Some(action.clone()), Some(handler)),
                    None => {
                        return Err(SagaError::UnresolvedCompensation {
                            saga: name,
                            step: descriptor.id,
                            compensation: handler,
                        });
                    }
                },
            };
            let step = StepDefinition::from_descriptor(descriptor, compensation, compensation_name);
            steps.insert(step.id.clone(), Arc::new(step));
        }

        for step in steps.values() {
            if let Some(missing) = step.depends_on.iter().find(|d| !steps.contains_key(*d)) {
                return Err(SagaError::MissingDependency {
                    saga: name,
                    step: step.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let dependency_map: HashMap<String, Vec<String>> = steps
            .iter()
            .map(|(id, step)| (id.clone(), step.depends_on.clone()))
            .collect();
        let layers = topology::compute_layers(&dependency_map)?;

        let definition = Arc::new(SagaDefinition {
            name: name.clone(),
            steps,
            layers,
            layer_concurrency,
            compensation_policy,
        });

        tracing::info!(
            "Registered saga {} ({} steps in {} layers)",
            name,
            definition.steps.len(),
            definition.layers.len()
        );

        match self.sagas.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Err(SagaError::DuplicateSaga {
                name: entry.key().clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(definition.clone());
                Ok(definition)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<SagaDefinition>> {
        self.sagas.get(name).map(|d| d.clone())
    }

    pub fn get_all(&self) -> Vec<Arc<SagaDefinition>> {
        let mut all: Vec<_> = self.sagas.iter().map(|d| d.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sagas.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.sagas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sagas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::topology::TopologyError;
    use serde_json::json;

    fn noop(id: &str) -> StepDescriptor {
        StepDescriptor::new(id, |_args: Arguments| async { Ok(Value::Null) })
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SagaRegistry::new();
        let definition = registry
            .register(
                SagaDeclaration::new("order")
                    .handler("refund", |_args: Arguments| async { Ok(json!("refunded")) })
                    .step(noop("reserve"))
                    .step(noop("charge").depends_on(["reserve"]).compensate_named("refund"))
                    .step(noop("notify").depends_on(["reserve"])),
            )
            .unwrap();

        assert_eq!(
            definition.layers,
            vec![vec!["reserve".to_string()], vec!["charge".into(), "notify".into()]]
        );
        let charge = definition.step("charge").unwrap();
        assert!(charge.has_compensation());
        assert_eq!(charge.compensation_name.as_deref(), Some("refund"));
        assert!(!definition.step("reserve").unwrap().has_compensation());

        assert!(registry.get("order").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.get_all().len(), 1);
    }

    #[test]
    fn test_missing_dependency_fails_at_registration() {
        let registry = SagaRegistry::new();
        let err = registry
            .register(SagaDeclaration::new("order").step(noop("charge").depends_on(["missing"])))
            .unwrap_err();
        assert!(matches!(
            err,
            SagaError::MissingDependency { ref step, ref dependency, .. }
                if step == "charge" && dependency == "missing"
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unresolved_compensation() {
        let registry = SagaRegistry::new();
        let err = registry
            .register(SagaDeclaration::new("order").step(noop("charge").compensate_named("refnud")))
            .unwrap_err();
        assert!(matches!(
            err,
            SagaError::UnresolvedCompensation { ref compensation, .. } if compensation == "refnud"
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let registry = SagaRegistry::new();
        let err = registry
            .register(
                SagaDeclaration::new("loop")
                    .step(noop("a").depends_on(["b"]))
                    .step(noop("b").depends_on(["a"])),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SagaError::Topology(TopologyError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_duplicates_and_empty() {
        let registry = SagaRegistry::new();
        assert!(matches!(
            registry.register(SagaDeclaration::new("empty")),
            Err(SagaError::EmptySaga { .. })
        ));
        assert!(matches!(
            registry.register(SagaDeclaration::new("dup").step(noop("a")).step(noop("a"))),
            Err(SagaError::DuplicateStep { .. })
        ));

        registry
            .register(SagaDeclaration::new("once").step(noop("a")))
            .unwrap();
        assert!(matches!(
            registry.register(SagaDeclaration::new("once").step(noop("a"))),
            Err(SagaError::DuplicateSaga { .. })
        ));
    }
}
