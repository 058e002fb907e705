//! In-memory implementation of the saga store for testing.
//!
//! Rows hold codec-serialized blobs, so every load reconstructs instances
//! through the type registry exactly like the SQL store does.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sagabus_core::codec::{JsonMessageCodec, group_kind_of_value};
use sagabus_core::registry::{Payload, TypeRegistry};
use sagabus_core::saga::{
    HistoryEvent, InstanceFilter, SagaInstance, SagaStatus, SagaStore, StoreError,
    effective_filters,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct StoredEvent {
    uid: String,
    payload: Value,
    status: SagaStatus,
    description: String,
    origin: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredInstance {
    uid: String,
    parent_uid: Option<String>,
    name: String,
    saga: Value,
    status: SagaStatus,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    history: Vec<StoredEvent>,
}

/// Thread-safe in-memory [`SagaStore`].
///
/// Tracks `create`/`update` call counts so tests can assert store traffic.
pub struct InMemorySagaStore {
    registry: Arc<TypeRegistry>,
    codec: JsonMessageCodec,
    rows: RwLock<HashMap<String, StoredInstance>>,
    create_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl InMemorySagaStore {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        let codec = JsonMessageCodec::new(Arc::clone(&registry));
        Self {
            registry,
            codec,
            rows: RwLock::new(HashMap::new()),
            create_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    pub fn saga_count(&self) -> usize {
        self.rows.read().len()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.rows.write().clear();
        self.create_calls.store(0, Ordering::SeqCst);
        self.update_calls.store(0, Ordering::SeqCst);
    }

    fn serialize_instance(&self, instance: &SagaInstance) -> Result<StoredInstance, StoreError> {
        let saga = instance
            .saga()
            .ok_or_else(|| StoreError::Serialization("saga payload detached".to_string()))?;
        let payload: &dyn Payload = saga;
        let blob = self
            .codec
            .encode_value(payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let name = instance
            .name()
            .map(|gk| gk.kind)
            .ok_or_else(|| StoreError::Serialization("saga payload detached".to_string()))?;

        Ok(StoredInstance {
            uid: instance.uid().to_string(),
            parent_uid: instance.parent_uid().map(str::to_string),
            name,
            saga: blob,
            status: instance.status(),
            started_at: instance.started_at(),
            updated_at: instance.updated_at(),
            history: Vec::new(),
        })
    }

    fn serialize_event(&self, event: &HistoryEvent) -> Result<StoredEvent, StoreError> {
        let payload = self
            .codec
            .encode_value(event.payload.as_ref())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(StoredEvent {
            uid: event.uid.clone(),
            payload,
            status: event.status,
            description: event.description.clone(),
            origin: event.origin.clone(),
            created_at: event.created_at,
        })
    }

    fn decode_instance(&self, row: &StoredInstance) -> Result<SagaInstance, StoreError> {
        let group_kind = group_kind_of_value(&row.saga)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let saga = self
            .registry
            .decode_saga_value(&group_kind, row.saga.clone())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let history = row
            .history
            .iter()
            .map(|event| self.decode_event(event))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SagaInstance::restore(
            row.uid.clone(),
            row.parent_uid.clone(),
            saga,
            row.status,
            row.started_at,
            row.updated_at,
            history,
        ))
    }

    fn decode_event(&self, event: &StoredEvent) -> Result<HistoryEvent, StoreError> {
        let group_kind = group_kind_of_value(&event.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let payload = self
            .registry
            .decode_value(&group_kind, event.payload.clone())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(HistoryEvent {
            uid: event.uid.clone(),
            payload,
            status: event.status,
            description: event.description.clone(),
            origin: event.origin.clone(),
            trace_uid: String::new(),
            created_at: event.created_at,
        })
    }

    fn matches(row: &StoredInstance, filter: &InstanceFilter) -> bool {
        match filter {
            InstanceFilter::Uid(uid) => row.uid == *uid,
            InstanceFilter::Status(status) => row.status == *status,
            InstanceFilter::SagaType(name) => row.name == *name,
        }
    }
}

// Operations never suspend, so honoring cancellation reduces to refusing
// work once the token has fired.
fn ensure_live(cancel: &CancellationToken) -> Result<(), StoreError> {
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    Ok(())
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create(
        &self,
        instance: &SagaInstance,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        ensure_live(cancel)?;
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let row = self.serialize_instance(instance)?;

        let mut rows = self.rows.write();
        if rows.contains_key(instance.uid()) {
            return Err(StoreError::Duplicate(instance.uid().to_string()));
        }
        // History is not persisted on creation.
        rows.insert(row.uid.clone(), row);
        Ok(())
    }

    async fn update(
        &self,
        instance: &SagaInstance,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        ensure_live(cancel)?;
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut row = self.serialize_instance(instance)?;

        let mut rows = self.rows.write();
        let existing = rows
            .get_mut(instance.uid())
            .ok_or_else(|| StoreError::SagaNotFound(instance.uid().to_string()))?;

        // Append-only history: keep persisted events, add only new IDs.
        let persisted: HashSet<String> =
            existing.history.iter().map(|e| e.uid.clone()).collect();
        row.history = existing.history.clone();
        for event in instance.history() {
            if !persisted.contains(&event.uid) {
                row.history.push(self.serialize_event(event)?);
            }
        }

        *existing = row;
        Ok(())
    }

    async fn get_by_id(
        &self,
        uid: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<SagaInstance>, StoreError> {
        ensure_live(cancel)?;
        let row = self.rows.read().get(uid).cloned();
        match row {
            Some(row) => self.decode_instance(&row).map(Some),
            None => Ok(None),
        }
    }

    async fn get_by_filter(
        &self,
        filters: &[InstanceFilter],
        cancel: &CancellationToken,
    ) -> Result<Vec<SagaInstance>, StoreError> {
        ensure_live(cancel)?;
        let effective = effective_filters(filters)?;
        let rows = self.rows.read().values().cloned().collect::<Vec<_>>();

        rows.iter()
            .filter(|row| effective.iter().all(|f| Self::matches(row, f)))
            .map(|row| self.decode_instance(row))
            .collect()
    }

    async fn delete(&self, uid: &str, cancel: &CancellationToken) -> Result<(), StoreError> {
        ensure_live(cancel)?;
        self.rows
            .write()
            .remove(uid)
            .map(|_| ())
            .ok_or_else(|| StoreError::SagaNotFound(uid.to_string()))
    }
}
