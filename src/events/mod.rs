//! Saga lifecycle notifications
//!
//! The engine fires [`SagaEvents::on_saga_completed`] once per execution at
//! terminal state; the recovery sweep fires it for every execution it forces
//! to `FAILED`. The per-step hooks are optional and default to no-ops.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaEvent {
    Completed {
        saga_name: String,
        correlation_id: String,
        success: bool,
    },
    StepSucceeded {
        saga_name: String,
        correlation_id: String,
        step_id: String,
        attempts: u32,
        latency_ms: u64,
    },
    StepFailed {
        saga_name: String,
        correlation_id: String,
        step_id: String,
        error: String,
    },
    StepCompensated {
        saga_name: String,
        correlation_id: String,
        step_id: String,
        error: Option<String>,
    },
}

/// Sink for saga lifecycle notifications
#[async_trait]
pub trait SagaEvents: Send + Sync + 'static {
    async fn on_saga_completed(&self, saga_name: &str, correlation_id: &str, success: bool);

    async fn on_step_succeeded(
        &self,
        _saga_name: &str,
        _correlation_id: &str,
        _step_id: &str,
        _attempts: u32,
        _latency_ms: u64,
    ) {
    }

    async fn on_step_failed(
        &self,
        _saga_name: &str,
        _correlation_id: &str,
        _step_id: &str,
        _error: &str,
    ) {
    }

    async fn on_step_compensated(
        &self,
        _saga_name: &str,
        _correlation_id: &str,
        _step_id: &str,
        _error: Option<&str>,
    ) {
    }
}

/// Discards every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

#[async_trait]
impl SagaEvents for NoopEvents {
    async fn on_saga_completed(&self, _saga_name: &str, _correlation_id: &str, _success: bool) {}
}

/// Writes notifications to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEvents;

#[async_trait]
impl SagaEvents for LoggingEvents {
    async fn on_saga_completed(&self, saga_name: &str, correlation_id: &str, success: bool) {
        if success {
            tracing::info!("Saga {} [{}] completed", saga_name, correlation_id);
        } else {
            tracing::warn!("Saga {} [{}] failed", saga_name, correlation_id);
        }
    }

    async fn on_step_succeeded(
        &self,
        saga_name: &str,
        correlation_id: &str,
        step_id: &str,
        attempts: u32,
        latency_ms: u64,
    ) {
        tracing::debug!(
            "Saga {} [{}] step {} done after {} attempt(s) in {}ms",
            saga_name,
            correlation_id,
            step_id,
            attempts,
            latency_ms
        );
    }

    async fn on_step_failed(&self, saga_name: &str, correlation_id: &str, step_id: &str, error: &str) {
        tracing::warn!(
            "Saga {} [{}] step {} failed: {}",
            saga_name,
            correlation_id,
            step_id,
            error
        );
    }

    async fn on_step_compensated(
        &self,
        saga_name: &str,
        correlation_id: &str,
        step_id: &str,
        error: Option<&str>,
    ) {
        match error {
            None => tracing::info!(
                "Saga {} [{}] step {} compensated",
                saga_name,
                correlation_id,
                step_id
            ),
            Some(e) => tracing::error!(
                "Saga {} [{}] compensation of {} failed: {}",
                saga_name,
                correlation_id,
                step_id,
                e
            ),
        }
    }
}

/// Fans notifications out to broadcast subscribers
///
/// Publishing with no live subscriber is not an error.
#[derive(Clone)]
pub struct BroadcastEvents {
    sender: broadcast::Sender<SagaEvent>,
}

impl Default for BroadcastEvents {
    fn default() -> Self {
        Self::new(100)
    }
}

impl BroadcastEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SagaEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: SagaEvent) {
        let _ = self.sender.send(event);
    }
}

#[async_trait]
impl SagaEvents for BroadcastEvents {
    async fn on_saga_completed(&self, saga_name: &str, correlation_id: &str, success: bool) {
        self.publish(SagaEvent::Completed {
            saga_name: saga_name.to_string(),
            correlation_id: correlation_id.to_string(),
            success,
        });
    }

    async fn on_step_succeeded(
        &self,
        saga_name: &str,
        correlation_id: &str,
        step_id: &str,
        attempts: u32,
        latency_ms: u64,
    ) {
        self.publish(SagaEvent::StepSucceeded {
            saga_name: saga_name.to_string(),
            correlation_id: correlation_id.to_string(),
            step_id: step_id.to_string(),
            attempts,
            latency_ms,
        });
    }

    async fn on_step_failed(&self, saga_name: &str, correlation_id: &str, step_id: &str, error: &str) {
        self.publish(SagaEvent::StepFailed {
            saga_name: saga_name.to_string(),
            correlation_id: correlation_id.to_string(),
            step_id: step_id.to_string(),
            error: error.to_string(),
        });
    }

    async fn on_step_compensated(
        &self,
        saga_name: &str,
        correlation_id: &str,
        step_id: &str,
        error: Option<&str>,
    ) {
        self.publish(SagaEvent::StepCompensated {
            saga_name: saga_name.to_string(),
            correlation_id: correlation_id.to_string(),
            step_id: step_id.to_string(),
            error: error.map(str::to_string),
        });
    }
}
