use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::persistence::SagaPersistence;
use crate::error::Result;
use crate::events::SagaEvents;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Fails forward executions left `IN_FLIGHT` by a crashed process
///
/// Recovery never replays compensation: the context of the crashed run is
/// gone. A stale execution is marked `FAILED` and reported through the
/// events port.
#[derive(Clone)]
pub struct SagaRecoveryService {
    persistence: Arc<dyn SagaPersistence>,
    events: Arc<dyn SagaEvents>,
}

impl SagaRecoveryService {
    pub fn new(persistence: Arc<dyn SagaPersistence>, events: Arc<dyn SagaEvents>) -> Self {
        Self {
            persistence,
            events,
        }
    }

    /// Mark every `IN_FLIGHT` execution started more than `threshold` ago as failed.
    /// Returns how many were recovered.
    pub async fn recover_stale(&self, threshold: Duration) -> Result<usize> {
        let cutoff = cutoff(threshold);
        let stale = self.persistence.get_stale(cutoff).await?;

        let mut recovered = 0;
        for record in stale.into_iter().filter(|r| r.is_in_flight()) {
            tracing::warn!(
                "Recovering stale saga {} [{}] started at {}",
                record.saga_name,
                record.correlation_id,
                record.started_at
            );
            self.persistence
                .mark_completed(&record.correlation_id, false)
                .await?;
            self.events
                .on_saga_completed(&record.saga_name, &record.correlation_id, false)
                .await;
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!("Recovered {} stale saga execution(s)", recovered);
        }
        Ok(recovered)
    }

    /// Delete terminal records completed more than `older_than_hours` ago
    pub async fn cleanup(&self, older_than_hours: u64) -> Result<usize> {
        let cutoff = cutoff(Duration::from_secs(older_than_hours.saturating_mul(3600)));
        let removed = self.persistence.cleanup(cutoff).await?;
        tracing::info!(
            "Removed {} saga record(s) completed more than {}h ago",
            removed,
            older_than_hours
        );
        Ok(removed)
    }

    /// Run [`recover_stale`](Self::recover_stale) every `interval` on a background task.
    /// A zero interval is raised to one millisecond.
    pub fn spawn(&self, interval: Duration, threshold: Duration) -> RecoveryHandle {
        let (shutdown, mut signal) = watch::channel(false);
        let service = self.clone();
        // `tokio::time::interval` rejects a zero period.
        let interval = interval.max(MIN_SWEEP_INTERVAL);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.recover_stale(threshold).await {
                            tracing::error!("Saga recovery sweep failed: {}", e);
                        }
                    }
                    _ = signal.changed() => break,
                }
            }
            tracing::debug!("Saga recovery task stopped");
        });

        RecoveryHandle { shutdown, task }
    }
}

fn cutoff(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Stops a recovery task started by [`SagaRecoveryService::spawn`]
pub struct RecoveryHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RecoveryHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("Saga recovery task ended abnormally: {}", e);
        }
    }
}
