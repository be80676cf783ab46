//! Admission semaphore
//!
//! Bounds the number of in-flight initial handshakes so that a large map
//! arriving at once cannot stampede the STUN/TURN infrastructure. A peer
//! session holds a permit from its first ICE gathering until it reaches
//! `Connected` or `Failed`; reconnects after an initial success bypass the
//! gate.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{EngineError, EngineResult};

/// Counting gate with a fixed ceiling.
#[derive(Debug)]
pub struct AdmissionSemaphore {
    inner: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionSemaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently available slots.
    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    /// Wait for a slot. The permit returns its slot when dropped.
    pub async fn acquire(&self) -> EngineResult<OwnedSemaphorePermit> {
        self.inner
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn capacity_is_enforced() {
        let gate = AdmissionSemaphore::new(2);
        let p1 = gate.acquire().await.unwrap();
        let _p2 = gate.acquire().await.unwrap();
        assert_eq!(gate.available(), 0);

        // a third acquire blocks until a permit is returned
        let blocked = tokio::time::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(blocked.is_err());

        drop(p1);
        let p3 = tokio::time::timeout(Duration::from_millis(50), gate.acquire())
            .await
            .expect("slot should free up");
        assert!(p3.is_ok());
    }

    #[tokio::test]
    async fn release_on_drop() {
        let gate = AdmissionSemaphore::new(1);
        {
            let _p = gate.acquire().await.unwrap();
            assert_eq!(gate.available(), 0);
        }
        assert_eq!(gate.available(), 1);
    }
}
