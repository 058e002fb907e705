//! Saga store port.

use super::instance::SagaInstance;
use super::status::SagaStatus;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Filter for [`SagaStore::get_by_filter`]. Filters with empty values are
/// ignored; a filter set that leaves no effective condition is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceFilter {
    /// Match the instance UID.
    Uid(String),
    /// Match the instance status.
    Status(SagaStatus),
    /// Match the registered kind of the saga payload.
    SagaType(String),
}

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("saga {0} already exists")]
    Duplicate(String),

    #[error("saga {0} not found")]
    SagaNotFound(String),

    #[error("at least one non-empty filter is required")]
    EmptyFilter,

    #[error("saga store operation cancelled")]
    Cancelled,

    #[error("serializing saga state: {0}")]
    Serialization(String),

    /// I/O failures, deadlocks, pool exhaustion. Retried implicitly via
    /// broker redelivery.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store backend: {0}")]
    Backend(String),
}

/// Persistent storage for saga instances and their history.
///
/// `create` persists the saga row only; history is written by `update`,
/// which appends events that are not yet persisted. History rows are never
/// updated or deleted while the instance lives.
///
/// Every operation takes an explicit cancellation token and must honor
/// it; a cancelled operation fails with [`StoreError::Cancelled`] and
/// leaves no partial writes behind.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Insert a new instance. Fails with [`StoreError::Duplicate`] when the
    /// UID already exists. History events are not persisted at this step.
    async fn create(
        &self,
        instance: &SagaInstance,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Transactionally overwrite the saga row and append history events
    /// whose IDs are not yet persisted.
    async fn update(
        &self,
        instance: &SagaInstance,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Fetch an instance with its history ordered by `created_at`
    /// ascending. Absence is `Ok(None)`, not an error.
    async fn get_by_id(
        &self,
        uid: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<SagaInstance>, StoreError>;

    /// Fetch instances matching all given filters. Instances without
    /// history still appear; result order is unspecified.
    async fn get_by_filter(
        &self,
        filters: &[InstanceFilter],
        cancel: &CancellationToken,
    ) -> Result<Vec<SagaInstance>, StoreError>;

    /// Delete an instance; history rows cascade. Zero affected rows fail
    /// with [`StoreError::SagaNotFound`].
    async fn delete(&self, uid: &str, cancel: &CancellationToken) -> Result<(), StoreError>;
}

impl InstanceFilter {
    /// A filter whose value is empty constrains nothing.
    pub fn is_effective(&self) -> bool {
        match self {
            InstanceFilter::Uid(uid) => !uid.is_empty(),
            InstanceFilter::Status(_) => true,
            InstanceFilter::SagaType(name) => !name.is_empty(),
        }
    }
}

/// Validate a filter set, returning only the effective filters.
pub fn effective_filters(filters: &[InstanceFilter]) -> Result<Vec<&InstanceFilter>, StoreError> {
    if filters.is_empty() {
        return Err(StoreError::EmptyFilter);
    }
    let effective: Vec<&InstanceFilter> =
        filters.iter().filter(|f| f.is_effective()).collect();
    if effective.is_empty() {
        return Err(StoreError::EmptyFilter);
    }
    Ok(effective)
}
