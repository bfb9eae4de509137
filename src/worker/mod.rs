use rayon::ThreadPool;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::StepError;

/// Shared thread pool for CPU-bound steps
///
/// Its thread count caps how many CPU-heavy steps run at once across every
/// saga sharing the pool.
#[derive(Clone)]
pub struct WorkerPool {
    pool: Arc<ThreadPool>,
}

impl WorkerPool {
    pub fn new(num_threads: usize) -> Result<Self, StepError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(|i| format!("saga-worker-{}", i))
            .build()
            .map_err(|e| StepError::WorkerUnavailable(e.to_string()))?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `f` on the pool and await its result without blocking the runtime
    pub async fn execute<F, R>(&self, f: F) -> Result<R, StepError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
            let _ = tx.send(outcome);
        });

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => Err(StepError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(StepError::WorkerUnavailable(
                "worker dropped the task".to_string(),
            )),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
