//! # sagabus-pg
//!
//! PostgreSQL backends for the sagabus ports:
//! - [`PostgresSagaStore`] — two-table instance storage with transactional,
//!   append-only history updates
//! - [`PostgresSagaMutex`] — distributed per-saga lock in a TTL'd lock
//!   table, with holder-bound release

pub mod mutex;
pub mod store;

pub use mutex::{PostgresMutexConfig, PostgresSagaMutex};
pub use store::{PostgresSagaStore, PostgresStoreConfig};
