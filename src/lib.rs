//! # Sagastra
//!
//! Orchestration of long-running business transactions as sagas.
//!
//! A saga is a DAG of forward steps, each with an optional compensating
//! action. Sagastra computes execution layers from the step dependencies,
//! runs each layer concurrently, retries failing steps with backoff and,
//! when a step fails for good, rolls back the completed steps under one of
//! several compensation policies. Executions are recorded through a
//! persistence port so that a recovery sweep can fail forward whatever a
//! crashed process left in flight. Sagas can be composed into larger
//! workflows with data flowing from one saga's results into the next one's
//! input.
//!
//! ## Features
//!
//! - **Layered execution**: Kahn layering, bounded per-layer concurrency, strict layer barrier
//! - **Retries & timeouts**: exponential backoff with jitter, per-attempt timeouts
//! - **CPU-bound lane**: blocking steps run on a shared rayon worker pool
//! - **Compensation policies**: strict sequential, grouped parallel, retry, circuit breaker, best effort
//! - **Persistence & recovery**: pluggable store, in-memory adapter, stale execution sweep
//! - **Composition**: multi-saga DAGs with data flow
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sagastra::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> sagastra::Result<()> {
//!     let registry = Arc::new(SagaRegistry::new());
//!     registry.register(
//!         SagaDeclaration::new("order-fulfillment")
//!             .handler("refund", |_args: Arguments| async { Ok(json!("refunded")) })
//!             .step(StepDescriptor::new("reserve-inventory", |_args: Arguments| async {
//!                 Ok(json!("reserved"))
//!             }))
//!             .step(
//!                 StepDescriptor::new("charge-payment", |args: Arguments| async move {
//!                     let amount: u64 = args.get(0)?;
//!                     Ok(json!({ "charged": amount }))
//!                 })
//!                 .params([Param::InputField("amount".into())])
//!                 .depends_on(["reserve-inventory"])
//!                 .retry(2)
//!                 .compensate_named("refund"),
//!             ),
//!     )?;
//!
//!     let engine = SagaEngine::builder(registry)
//!         .events(Arc::new(LoggingEvents))
//!         .config(EngineConfig::from_env()?)
//!         .build()?;
//!
//!     let result = engine.execute("order-fulfillment", json!({ "amount": 100 })).await?;
//!     println!("success: {}", result.success);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod saga;
pub mod worker;

// Re-export core types
pub use config::{ConfigSource, EngineConfig};
pub use error::{Result, SagaError, StepError};
pub use events::{BroadcastEvents, LoggingEvents, NoopEvents, SagaEvent, SagaEvents};
pub use saga::{
    CompensationPolicy, SagaDeclaration, SagaEngine, SagaRecoveryService, SagaRegistry,
    SagaResult, StepDescriptor,
};
pub use worker::WorkerPool;

// Re-export commonly used types from dependencies
pub use async_trait::async_trait;

/// Prelude module for convenient imports
///
/// ```
/// use sagastra::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{ConfigSource, EngineConfig};
    pub use crate::error::{Result, SagaError, StepError};
    pub use crate::events::{BroadcastEvents, LoggingEvents, NoopEvents, SagaEvent, SagaEvents};
    pub use crate::saga::composition::{
        CompositionEntry, CompositionResult, DataFlow, SagaComposition, SagaCompositionBuilder,
        SagaCompositor,
    };
    pub use crate::saga::persistence::{InMemorySagaPersistence, SagaPersistence};
    pub use crate::saga::{
        Action, Arguments, CompensationPolicy, ContextKey, ExecuteOptions, Param,
        RecoveryHandle, SagaContext, SagaDeclaration, SagaEngine, SagaRecoveryService,
        SagaRegistry, SagaResult, StepDescriptor, StepOutcome, StepStatus,
    };
    pub use crate::worker::WorkerPool;
    pub use async_trait::async_trait;
    pub use std::sync::Arc;
}
