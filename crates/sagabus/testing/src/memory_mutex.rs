//! In-process saga mutex for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use sagabus_core::saga::{MutexError, SagaMutex};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// Per-key async mutex implementing the distributed mutex port inside one
/// process. Mutual exclusion holds across tasks; holder identity degrades
/// to "this process", which is what single-process tests need.
#[derive(Default)]
pub struct InMemoryMutex {
    locks: DashMap<String, Arc<Mutex<()>>>,
    held: DashMap<String, OwnedMutexGuard<()>>,
}

impl InMemoryMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

#[async_trait]
impl SagaMutex for InMemoryMutex {
    async fn lock(&self, saga_uid: &str, cancel: &CancellationToken) -> Result<(), MutexError> {
        let lock = self
            .locks
            .entry(saga_uid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = tokio::select! {
            biased;
            guard = lock.lock_owned() => guard,
            _ = cancel.cancelled() => {
                return Err(MutexError::Cancelled {
                    uid: saga_uid.to_string(),
                });
            }
        };
        self.held.insert(saga_uid.to_string(), guard);
        Ok(())
    }

    async fn release(&self, saga_uid: &str, _cancel: &CancellationToken) -> Result<(), MutexError> {
        // Dropping the guard is instant; nothing to interrupt.
        self.held
            .remove(saga_uid)
            .map(|_| ())
            .ok_or_else(|| MutexError::NotHeld {
                uid: saga_uid.to_string(),
            })
    }
}
