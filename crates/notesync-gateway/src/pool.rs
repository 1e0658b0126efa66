//! Bounded pool for background work such as paragraph runs

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Runs submitted futures with at most `size` in flight
#[derive(Debug, Clone)]
pub struct TaskPool {
    permits: Arc<Semaphore>,
}

impl TaskPool {
    /// A `size` of zero is treated as one
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Permits not currently held by a running task
    #[cfg(test)]
    fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Queue `future`; it starts once a permit is free
    pub fn submit<F>(&self, task: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(task, error = %e, "task pool closed");
                    return;
                }
            };
            debug!(task, "task started");
            future.await;
        })
    }
}
