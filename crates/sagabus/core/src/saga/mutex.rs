//! Distributed per-saga mutex port.
//!
//! The mutex guarantees single-writer semantics for a saga UID across
//! orchestrator replicas. Lock identity is bound to the holder, so foreign
//! releases fail, and implementations carry a TTL so dead holders expire.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Grace period for releasing a lock on the way out of a turn. Independent
/// of the ambient turn deadline so shutdown cannot leak locks.
pub const RELEASE_GRACE: Duration = Duration::from_secs(30);

/// Errors from mutex operations.
#[derive(Debug, thiserror::Error)]
pub enum MutexError {
    /// The lock is not (or no longer) held by this replica. Surfaces a
    /// stolen lock after TTL expiry.
    #[error("lock on saga {uid} is not held by this replica")]
    NotHeld { uid: String },

    /// The blocking acquisition (or a release) was cancelled.
    #[error("lock operation on saga {uid} was cancelled")]
    Cancelled { uid: String },

    #[error("mutex backend: {0}")]
    Backend(String),
}

/// Blocking advisory lock keyed by saga UID.
///
/// `lock` blocks until the lock is held or the cancellation token fires,
/// in which case it fails with [`MutexError::Cancelled`]. Callers must not
/// take the same lock twice in one turn; re-entrancy is undefined.
#[async_trait]
pub trait SagaMutex: Send + Sync {
    async fn lock(&self, saga_uid: &str, cancel: &CancellationToken) -> Result<(), MutexError>;

    async fn release(&self, saga_uid: &str, cancel: &CancellationToken)
    -> Result<(), MutexError>;
}

/// RAII wrapper around a held saga lock.
///
/// Prefer the explicit [`HeldLock::release`]; if the guard is dropped
/// without it (panic, early return at an await point), the release is
/// spawned in the background with the same bounded grace period. Release
/// failures are logged and never propagated.
pub struct HeldLock {
    mutex: Arc<dyn SagaMutex>,
    uid: String,
    released: bool,
}

impl std::fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeldLock")
            .field("uid", &self.uid)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl HeldLock {
    /// Acquire the lock for `saga_uid`, blocking until held or cancelled.
    pub async fn acquire(
        mutex: Arc<dyn SagaMutex>,
        saga_uid: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<Self, MutexError> {
        let uid = saga_uid.into();
        mutex.lock(&uid, cancel).await?;
        Ok(Self {
            mutex,
            uid,
            released: false,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Release the lock within the grace period.
    pub async fn release(mut self) {
        self.released = true;
        release_with_grace(&self.mutex, &self.uid).await;
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if !self.released {
            let mutex = Arc::clone(&self.mutex);
            let uid = std::mem::take(&mut self.uid);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    release_with_grace(&mutex, &uid).await;
                });
            } else {
                warn!(saga_uid = %uid, "saga lock dropped outside a runtime; relying on TTL expiry");
            }
        }
    }
}

async fn release_with_grace(mutex: &Arc<dyn SagaMutex>, uid: &str) {
    // The release runs under its own bounded context, independent of the
    // turn deadline, so shutdown cannot leak locks.
    let cancel = CancellationToken::new();
    match tokio::time::timeout(RELEASE_GRACE, mutex.release(uid, &cancel)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(saga_uid = %uid, error = %err, "failed to release saga lock");
        }
        Err(_) => {
            cancel.cancel();
            warn!(saga_uid = %uid, "saga lock release timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeMutex {
        held: PlMutex<HashSet<String>>,
    }

    #[async_trait]
    impl SagaMutex for FakeMutex {
        async fn lock(
            &self,
            saga_uid: &str,
            _cancel: &CancellationToken,
        ) -> Result<(), MutexError> {
            self.held.lock().insert(saga_uid.to_string());
            Ok(())
        }

        async fn release(
            &self,
            saga_uid: &str,
            _cancel: &CancellationToken,
        ) -> Result<(), MutexError> {
            if self.held.lock().remove(saga_uid) {
                Ok(())
            } else {
                Err(MutexError::NotHeld {
                    uid: saga_uid.to_string(),
                })
            }
        }
    }

    #[tokio::test]
    async fn explicit_release_frees_the_lock() {
        let mutex: Arc<dyn SagaMutex> = Arc::new(FakeMutex::default());
        let cancel = CancellationToken::new();
        let lock = HeldLock::acquire(Arc::clone(&mutex), "s-1", &cancel)
            .await
            .unwrap();
        assert_eq!(lock.uid(), "s-1");
        lock.release().await;

        // Second release of the same uid fails: it is no longer held.
        assert!(matches!(
            mutex.release("s-1", &cancel).await,
            Err(MutexError::NotHeld { .. })
        ));
    }

    #[tokio::test]
    async fn dropping_the_guard_releases_in_the_background() {
        let fake = Arc::new(FakeMutex::default());
        let mutex: Arc<dyn SagaMutex> = fake.clone();
        {
            let _lock = HeldLock::acquire(Arc::clone(&mutex), "s-2", &CancellationToken::new())
                .await
                .unwrap();
        }
        // Drop spawns the release; give it a moment.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!fake.held.lock().contains("s-2"));
    }
}
