//! # sagabus-local
//!
//! In-process [`Transport`](sagabus_core::Transport) over Tokio channels:
//! declared queues, topic bindings, prefetch, ack/reject and redelivery of
//! unacked envelopes — broker semantics without a broker. Useful for tests
//! and single-process deployments.

pub mod transport;

pub use transport::MemoryTransport;
