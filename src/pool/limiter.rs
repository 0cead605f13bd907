use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, TransportError};

/// Process wide cap on live connections. Worker pool shards each hold a clone
/// so the `max_total` bound spans every event loop thread.
#[derive(Clone, Debug)]
pub struct CapacityLimiter {
    sem: Arc<Semaphore>,
}

impl CapacityLimiter {
    pub fn new(max_total: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(max_total.min(Semaphore::MAX_PERMITS))),
        }
    }

    #[inline]
    pub(crate) fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.sem.clone().try_acquire_owned().ok()
    }

    pub(crate) async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Closed)
    }
}
