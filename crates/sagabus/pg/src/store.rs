//! PostgreSQL saga store.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE saga (
//!     id         VARCHAR(255) PRIMARY KEY,
//!     parent_id  VARCHAR(255),
//!     name       VARCHAR(255) NOT NULL,
//!     payload    JSONB NOT NULL,
//!     status     VARCHAR(32) NOT NULL,
//!     started_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE saga_history (
//!     id            VARCHAR(255) PRIMARY KEY,
//!     saga_id       VARCHAR(255) NOT NULL REFERENCES saga (id)
//!                       ON UPDATE CASCADE ON DELETE CASCADE,
//!     name          VARCHAR(255) NOT NULL,
//!     type          VARCHAR(255) NOT NULL,
//!     status        VARCHAR(32) NOT NULL,
//!     payload       JSONB NOT NULL,
//!     description   TEXT NOT NULL DEFAULT '',
//!     origin_source VARCHAR(255) NOT NULL DEFAULT '',
//!     created_at    TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! Payload blobs are written with the self-describing codec, so a stored
//! saga or history event reconstructs through the type registry alone.
//! History is append-only: `update` inserts only the events whose IDs are
//! not yet persisted and never touches existing rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sagabus_core::codec::{JsonMessageCodec, group_kind_of_value};
use sagabus_core::registry::{Payload, TypeRegistry};
use sagabus_core::saga::{
    HistoryEvent, InstanceFilter, SagaInstance, SagaStatus, SagaStore, StoreError,
    effective_filters,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder, Row};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pool configuration for the store.
#[derive(Debug, Clone)]
pub struct PostgresStoreConfig {
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl Default for PostgresStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl PostgresStoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }
}

/// PostgreSQL-backed [`SagaStore`].
pub struct PostgresSagaStore {
    pool: PgPool,
    registry: Arc<TypeRegistry>,
    codec: JsonMessageCodec,
}

impl PostgresSagaStore {
    pub fn new(pool: PgPool, registry: Arc<TypeRegistry>) -> Self {
        let codec = JsonMessageCodec::new(Arc::clone(&registry));
        Self {
            pool,
            registry,
            codec,
        }
    }

    /// Connect a pool and build the store.
    pub async fn connect(
        url: &str,
        config: PostgresStoreConfig,
        registry: Arc<TypeRegistry>,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect(url)
            .await?;
        Ok(Self::new(pool, registry))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the saga tables when absent.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS saga (
                id         VARCHAR(255) PRIMARY KEY,
                parent_id  VARCHAR(255),
                name       VARCHAR(255) NOT NULL,
                payload    JSONB NOT NULL,
                status     VARCHAR(32) NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS saga_history (
                id            VARCHAR(255) PRIMARY KEY,
                saga_id       VARCHAR(255) NOT NULL REFERENCES saga (id)
                                  ON UPDATE CASCADE ON DELETE CASCADE,
                name          VARCHAR(255) NOT NULL,
                type          VARCHAR(255) NOT NULL,
                status        VARCHAR(32) NOT NULL,
                payload       JSONB NOT NULL,
                description   TEXT NOT NULL DEFAULT '',
                origin_source VARCHAR(255) NOT NULL DEFAULT '',
                created_at    TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_saga_history_saga_id \
             ON saga_history (saga_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn saga_blob(&self, instance: &SagaInstance) -> Result<serde_json::Value, StoreError> {
        let saga = instance
            .saga()
            .ok_or_else(|| StoreError::Serialization("saga payload detached".to_string()))?;
        let payload: &dyn Payload = saga;
        self.codec
            .encode_value(payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn instance_name(&self, instance: &SagaInstance) -> Result<String, StoreError> {
        instance
            .name()
            .map(|gk| gk.kind)
            .ok_or_else(|| StoreError::Serialization("saga payload detached".to_string()))
    }

    fn decode_instance(
        &self,
        row: SagaRow,
        history: Vec<HistoryEvent>,
    ) -> Result<SagaInstance, StoreError> {
        let status: SagaStatus = row.status.parse().map_err(StoreError::Backend)?;
        let group_kind = group_kind_of_value(&row.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let saga = self
            .registry
            .decode_saga_value(&group_kind, row.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(SagaInstance::restore(
            row.id,
            row.parent_id.filter(|p| !p.is_empty()),
            saga,
            status,
            row.started_at,
            row.updated_at,
            history,
        ))
    }

    fn decode_event(&self, row: HistoryRow) -> Result<HistoryEvent, StoreError> {
        let status: SagaStatus = row.status.parse().map_err(StoreError::Backend)?;
        let group_kind = group_kind_of_value(&row.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let payload = self
            .registry
            .decode_value(&group_kind, row.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(HistoryEvent {
            uid: row.id,
            payload,
            status,
            description: row.description,
            origin: row.origin_source,
            trace_uid: String::new(),
            created_at: row.created_at,
        })
    }

    async fn fetch_history(&self, saga_uid: &str) -> Result<Vec<HistoryEvent>, StoreError> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT id, name, type, status, payload, description, origin_source, created_at \
             FROM saga_history WHERE saga_id = $1 ORDER BY created_at ASC",
        )
        .bind(saga_uid)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter().map(|row| self.decode_event(row)).collect()
    }
}

/// Race a store operation against its cancellation token. Dropping an
/// open transaction mid-flight rolls it back, so a cancelled operation
/// leaves no partial writes.
async fn cancellable<T, F>(cancel: &CancellationToken, op: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        result = op => result,
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn create(
        &self,
        instance: &SagaInstance,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        cancellable(cancel, self.create_inner(instance)).await
    }

    async fn update(
        &self,
        instance: &SagaInstance,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        cancellable(cancel, self.update_inner(instance)).await
    }

    async fn get_by_id(
        &self,
        uid: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<SagaInstance>, StoreError> {
        cancellable(cancel, self.get_by_id_inner(uid)).await
    }

    async fn get_by_filter(
        &self,
        filters: &[InstanceFilter],
        cancel: &CancellationToken,
    ) -> Result<Vec<SagaInstance>, StoreError> {
        cancellable(cancel, self.get_by_filter_inner(filters)).await
    }

    async fn delete(&self, uid: &str, cancel: &CancellationToken) -> Result<(), StoreError> {
        cancellable(cancel, self.delete_inner(uid)).await
    }
}

impl PostgresSagaStore {
    async fn create_inner(&self, instance: &SagaInstance) -> Result<(), StoreError> {
        let payload = self.saga_blob(instance)?;
        let name = self.instance_name(instance)?;

        let mut tx = self.pool.begin().await.map_err(classify)?;
        let result = sqlx::query(
            "INSERT INTO saga (id, parent_id, name, payload, status, started_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(instance.uid())
        .bind(instance.parent_uid())
        .bind(&name)
        .bind(&payload)
        .bind(instance.status().as_str())
        .bind(instance.started_at())
        .bind(instance.updated_at())
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => tx.commit().await.map_err(classify),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::Duplicate(instance.uid().to_string()))
            }
            Err(err) => Err(classify(err)),
        }
    }

    async fn update_inner(&self, instance: &SagaInstance) -> Result<(), StoreError> {
        let payload = self.saga_blob(instance)?;
        let name = self.instance_name(instance)?;

        let mut tx = self.pool.begin().await.map_err(classify)?;

        sqlx::query(
            "UPDATE saga SET parent_id = $1, name = $2, payload = $3, status = $4, \
             started_at = $5, updated_at = $6 WHERE id = $7",
        )
        .bind(instance.parent_uid())
        .bind(&name)
        .bind(&payload)
        .bind(instance.status().as_str())
        .bind(instance.started_at())
        .bind(instance.updated_at())
        .bind(instance.uid())
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        let persisted: HashSet<String> =
            sqlx::query_scalar("SELECT id FROM saga_history WHERE saga_id = $1")
                .bind(instance.uid())
                .fetch_all(&mut *tx)
                .await
                .map_err(classify)?
                .into_iter()
                .collect();

        for event in instance.history() {
            if persisted.contains(&event.uid) {
                continue;
            }
            let group_kind = event.group_kind();
            let event_payload = self
                .codec
                .encode_value(event.payload.as_ref())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            sqlx::query(
                "INSERT INTO saga_history \
                 (id, saga_id, name, type, status, payload, description, origin_source, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(&event.uid)
            .bind(instance.uid())
            .bind(&group_kind.kind)
            .bind(&group_kind.group)
            .bind(event.status.as_str())
            .bind(&event_payload)
            .bind(&event.description)
            .bind(&event.origin)
            .bind(event.created_at)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        tx.commit().await.map_err(classify)
    }

    async fn get_by_id_inner(&self, uid: &str) -> Result<Option<SagaInstance>, StoreError> {
        let row: Option<SagaRow> = sqlx::query_as(
            "SELECT id, parent_id, name, payload, status, started_at, updated_at \
             FROM saga WHERE id = $1",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let history = self.fetch_history(uid).await?;
        self.decode_instance(row, history).map(Some)
    }

    async fn get_by_filter_inner(
        &self,
        filters: &[InstanceFilter],
    ) -> Result<Vec<SagaInstance>, StoreError> {
        let effective = effective_filters(filters)?;

        let mut builder = QueryBuilder::new(
            "SELECT s.id, s.parent_id, s.name, s.payload, s.status, s.started_at, s.updated_at, \
             h.id AS h_id, h.status AS h_status, h.payload AS h_payload, \
             h.description AS h_description, h.origin_source AS h_origin, \
             h.created_at AS h_created_at \
             FROM saga s LEFT JOIN saga_history h ON s.id = h.saga_id WHERE ",
        );
        for (i, filter) in effective.iter().enumerate() {
            if i > 0 {
                builder.push(" AND ");
            }
            match filter {
                InstanceFilter::Uid(uid) => {
                    builder.push("s.id = ").push_bind(uid.clone());
                }
                InstanceFilter::Status(status) => {
                    builder.push("s.status = ").push_bind(status.as_str());
                }
                InstanceFilter::SagaType(name) => {
                    builder.push("s.name = ").push_bind(name.clone());
                }
            }
        }
        builder.push(" ORDER BY h.created_at ASC");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;

        // Deduplicate by saga UID; the outer set order is unspecified.
        let mut sagas: HashMap<String, SagaRow> = HashMap::new();
        let mut histories: HashMap<String, Vec<HistoryEvent>> = HashMap::new();

        for row in rows {
            let saga_row = SagaRow {
                id: row.try_get("id").map_err(classify)?,
                parent_id: row.try_get("parent_id").map_err(classify)?,
                name: row.try_get("name").map_err(classify)?,
                payload: row.try_get("payload").map_err(classify)?,
                status: row.try_get("status").map_err(classify)?,
                started_at: row.try_get("started_at").map_err(classify)?,
                updated_at: row.try_get("updated_at").map_err(classify)?,
            };
            let saga_uid = saga_row.id.clone();
            sagas.entry(saga_uid.clone()).or_insert(saga_row);

            let event_id: Option<String> = row.try_get("h_id").map_err(classify)?;
            if let Some(event_id) = event_id {
                let event = self.decode_event(HistoryRow {
                    id: event_id,
                    name: String::new(),
                    r#type: String::new(),
                    status: row.try_get("h_status").map_err(classify)?,
                    payload: row.try_get("h_payload").map_err(classify)?,
                    description: row.try_get("h_description").map_err(classify)?,
                    origin_source: row.try_get("h_origin").map_err(classify)?,
                    created_at: row.try_get("h_created_at").map_err(classify)?,
                })?;
                histories.entry(saga_uid).or_default().push(event);
            }
        }

        sagas
            .into_iter()
            .map(|(uid, row)| {
                let history = histories.remove(&uid).unwrap_or_default();
                self.decode_instance(row, history)
            })
            .collect()
    }

    async fn delete_inner(&self, uid: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM saga WHERE id = $1")
            .bind(uid)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SagaNotFound(uid.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SagaRow {
    id: String,
    parent_id: Option<String>,
    #[allow(dead_code)]
    name: String,
    payload: serde_json::Value,
    status: String,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    id: String,
    #[allow(dead_code)]
    name: String,
    #[allow(dead_code)]
    r#type: String,
    status: String,
    payload: serde_json::Value,
    description: String,
    origin_source: String,
    created_at: DateTime<Utc>,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Map driver errors onto the store error kinds; serialization failures
/// and deadlocks are transient and retried via broker redelivery.
fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Transient(err.to_string())
        }
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("40001") | Some("40P01") => StoreError::Transient(err.to_string()),
            _ => StoreError::Backend(err.to_string()),
        },
        _ => StoreError::Backend(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_transient() {
        assert!(matches!(
            classify(sqlx::Error::PoolTimedOut),
            StoreError::Transient(_)
        ));
    }

    #[test]
    fn other_driver_errors_are_backend() {
        assert!(matches!(
            classify(sqlx::Error::RowNotFound),
            StoreError::Backend(_)
        ));
    }

    #[test]
    fn config_defaults() {
        let config = PostgresStoreConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }
}
