use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Caps how many downloads and transcodes run at once. Cache hits never touch
/// the scheduler.
#[derive(Clone, Debug)]
pub struct DownloadScheduler {
    semaphore: Arc<Semaphore>,
    permits: usize,
}

impl DownloadScheduler {
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            permits,
        }
    }

    /// Waits for a free slot. The slot is released when the permit is dropped.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        debug!(event = "scheduler_wait", available = self.semaphore.available_permits());
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("download semaphore is never closed");
        debug!(event = "scheduler_acquired", available = self.semaphore.available_permits());
        permit
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    pub fn in_flight(&self) -> usize {
        self.permits - self.semaphore.available_permits()
    }
}
