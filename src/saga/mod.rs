//! Saga orchestration
//!
//! A saga is a set of steps with dependencies between them. Registration
//! validates the declaration and computes execution layers once; execution
//! runs the layers in order and, when a step fails for good, compensates the
//! steps that completed.
//!
//! ```rust,ignore
//! let registry = Arc::new(SagaRegistry::new());
//! registry.register(
//!     SagaDeclaration::new("order-fulfillment")
//!         .handler("refund", refund)
//!         .step(StepDescriptor::new("reserve-inventory", reserve))
//!         .step(
//!             StepDescriptor::new("charge-payment", charge)
//!                 .depends_on(["reserve-inventory"])
//!                 .retry(2)
//!                 .backoff_ms(100)
//!                 .compensate_named("refund"),
//!         ),
//! )?;
//!
//! let engine = SagaEngine::builder(registry).build()?;
//! let result = engine.execute("order-fulfillment", json!({ "amount": 100 })).await?;
//! ```

mod compensator;
mod context;
mod engine;
mod invoker;
mod orchestrator;
mod recovery;
mod registry;
mod result;
mod step;

pub mod composition;
pub mod persistence;
pub mod topology;

pub use compensator::{CompensationPolicy, CompensationReport, SagaCompensator};
pub use context::{ContextKey, SagaContext, StepStatus};
pub use engine::{ExecuteOptions, SagaEngine, SagaEngineBuilder};
pub use invoker::{ArgumentResolver, Arguments, Param, StepInvoker};
pub use orchestrator::{OrchestrationOutcome, SagaExecutionOrchestrator};
pub use recovery::{RecoveryHandle, SagaRecoveryService};
pub use registry::{SagaDeclaration, SagaDefinition, SagaRegistry};
pub use result::{SagaResult, StepOutcome};
pub use step::{Action, BlockingFn, CompensationRef, StepAction, StepDefinition, StepDescriptor};
