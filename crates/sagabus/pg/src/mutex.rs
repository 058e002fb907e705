//! Distributed saga mutex over a PostgreSQL lock table.
//!
//! The lock row carries the holder (a per-replica id), an acquisition
//! token and a TTL. Acquisition atomically claims a free or expired row;
//! release deletes only the row holding this replica's token, so foreign
//! releases fail and a lock stolen after TTL expiry surfaces as
//! [`MutexError::NotHeld`].
//!
//! The TTL must exceed the per-message processing deadline so a live turn
//! never loses its lock mid-flight, while dead holders still expire.

use async_trait::async_trait;
use dashmap::DashMap;
use sagabus_core::saga::{MutexError, SagaMutex};
use sqlx::PgPool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Configuration for [`PostgresSagaMutex`].
#[derive(Debug, Clone)]
pub struct PostgresMutexConfig {
    /// Lock lifetime; expired locks are claimable by other replicas.
    pub ttl: Duration,
    /// Sleep between acquisition attempts while the lock is contended.
    pub retry_interval: Duration,
}

impl Default for PostgresMutexConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(90),
            retry_interval: Duration::from_millis(100),
        }
    }
}

impl PostgresMutexConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// PostgreSQL-backed [`SagaMutex`].
pub struct PostgresSagaMutex {
    pool: PgPool,
    config: PostgresMutexConfig,
    holder: String,
    tokens: DashMap<String, Uuid>,
}

impl PostgresSagaMutex {
    pub fn new(pool: PgPool, config: PostgresMutexConfig) -> Self {
        Self {
            pool,
            config,
            holder: Uuid::new_v4().to_string(),
            tokens: DashMap::new(),
        }
    }

    /// Replica identity bound into every lock this mutex takes.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Create the lock table when absent.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS saga_lock (
                saga_uid   VARCHAR(255) PRIMARY KEY,
                holder     VARCHAR(64) NOT NULL,
                token      UUID NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_acquire(&self, saga_uid: &str, token: Uuid) -> Result<bool, MutexError> {
        let result = sqlx::query(
            "INSERT INTO saga_lock (saga_uid, holder, token, expires_at) \
             VALUES ($1, $2, $3, now() + make_interval(secs => $4)) \
             ON CONFLICT (saga_uid) DO UPDATE \
             SET holder = EXCLUDED.holder, token = EXCLUDED.token, \
                 expires_at = EXCLUDED.expires_at \
             WHERE saga_lock.expires_at <= now()",
        )
        .bind(saga_uid)
        .bind(&self.holder)
        .bind(token)
        .bind(self.config.ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| MutexError::Backend(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SagaMutex for PostgresSagaMutex {
    async fn lock(&self, saga_uid: &str, cancel: &CancellationToken) -> Result<(), MutexError> {
        let token = Uuid::new_v4();
        loop {
            if cancel.is_cancelled() {
                return Err(MutexError::Cancelled {
                    uid: saga_uid.to_string(),
                });
            }
            if self.try_acquire(saga_uid, token).await? {
                self.tokens.insert(saga_uid.to_string(), token);
                return Ok(());
            }
            debug!(saga_uid, "saga lock contended, retrying");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(MutexError::Cancelled {
                        uid: saga_uid.to_string(),
                    });
                }
                _ = tokio::time::sleep(self.config.retry_interval) => {}
            }
        }
    }

    async fn release(&self, saga_uid: &str, cancel: &CancellationToken) -> Result<(), MutexError> {
        let (_, token) = self.tokens.remove(saga_uid).ok_or_else(|| MutexError::NotHeld {
            uid: saga_uid.to_string(),
        })?;

        let delete = sqlx::query("DELETE FROM saga_lock WHERE saga_uid = $1 AND token = $2")
            .bind(saga_uid)
            .bind(token)
            .execute(&self.pool);
        let result = tokio::select! {
            biased;
            result = delete => result.map_err(|e| MutexError::Backend(e.to_string()))?,
            _ = cancel.cancelled() => {
                return Err(MutexError::Cancelled {
                    uid: saga_uid.to_string(),
                });
            }
        };

        if result.rows_affected() == 0 {
            // The TTL expired mid-turn and another replica claimed the row.
            return Err(MutexError::NotHeld {
                uid: saga_uid.to_string(),
            });
        }
        Ok(())
    }
}
