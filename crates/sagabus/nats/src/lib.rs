//! # sagabus-nats
//!
//! NATS Core pub/sub binding of the [`Transport`](sagabus_core::Transport)
//! port.
//!
//! Topics map to subject prefixes (`topic.routing_key`) and queues to NATS
//! queue-group subscriptions, so replicas load-balance deliveries.
//! Acknowledgement is tracked client-side: rejecting with requeue (and
//! dropping an unacked envelope) republishes to the origin subject.
//!
//! # Note
//!
//! NATS Core favors latency and deployment simplicity over broker-side
//! redelivery. For durable at-least-once delivery with broker-managed
//! retries, put a JetStream-backed implementation behind the same port.

pub mod transport;

pub use transport::{NatsTransport, NatsTransportConfig};
