//! Broker-agnostic transport port.
//!
//! A [`Transport`] knows how to declare topics and queues, publish
//! [`OutboundEnvelope`]s and consume [`InboundEnvelope`]s. Consumers are
//! scoped to a [`CancellationToken`]: cancelling it terminates every
//! per-queue consumer and closes the inbound channel once they drain.
//!
//! Acknowledgement is at-least-once. Redelivery of rejected or unacked
//! envelopes is the broker's responsibility; handlers must tolerate
//! replays.

use crate::message::Headers;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A named topic (exchange) messages are published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub name: String,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A named queue messages are consumed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Queue {
    pub name: String,
}

impl Queue {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Binds a queue to a topic for a set of routing keys. An empty key set
/// matches every key published to the topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub topic: String,
    pub routing_keys: Vec<String>,
}

impl QueueBinding {
    pub fn new(topic: impl Into<String>, routing_keys: Vec<String>) -> Self {
        Self {
            topic: topic.into(),
            routing_keys,
        }
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        self.routing_keys.is_empty() || self.routing_keys.iter().any(|k| k == routing_key)
    }
}

/// Where an outgoing envelope is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub topic: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(topic: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Wire-level outgoing message: encoded body plus headers.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub uid: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Per-call consume options. Transports reject option kinds they cannot
/// honor with [`TransportError::BadOption`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOption {
    PrefetchCount(u16),
    Exclusive,
    NoLocal,
    NoWait,
}

/// Per-call send options. `Mandatory` and `Immediate` are independent
/// flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOption {
    Mandatory,
    Immediate,
}

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport operation cancelled")]
    Cancelled,

    #[error("option {0} is not supported by this transport")]
    BadOption(&'static str),

    #[error("queue {0} is not declared")]
    UnknownQueue(String),

    #[error("sending to {topic}/{routing_key}: {reason}")]
    Send {
        topic: String,
        routing_key: String,
        reason: String,
    },

    #[error("consuming: {0}")]
    Consume(String),

    #[error("transport backend: {0}")]
    Backend(String),
}

/// A single delivered message with its acknowledgement surface.
///
/// Dropping an envelope without acking it leaves redelivery to the broker.
#[async_trait]
pub trait InboundEnvelope: Send + Sync {
    /// Unique message id.
    fn uid(&self) -> &str;

    /// Queue this envelope was consumed from.
    fn origin(&self) -> &str;

    fn headers(&self) -> &Headers;

    /// Raw payload bytes, decoded by the codec downstream.
    fn body(&self) -> &[u8];

    async fn ack(&self) -> Result<(), TransportError>;

    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// Consume/produce primitives over some broker.
///
/// Every operation takes an explicit cancellation token and must honor
/// it; there is no ambient context. A cancelled operation fails with
/// [`TransportError::Cancelled`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the broker. Idempotent.
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), TransportError>;

    /// Disconnect from the broker. Idempotent.
    async fn disconnect(&self, cancel: &CancellationToken) -> Result<(), TransportError>;

    async fn declare_topic(
        &self,
        topic: &Topic,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    async fn declare_queue(
        &self,
        queue: &Queue,
        bindings: &[QueueBinding],
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    /// Publish one envelope. Returns once the broker accepted it.
    async fn send(
        &self,
        destination: &Destination,
        envelope: OutboundEnvelope,
        options: &[SendOption],
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    /// Start consuming from the given queues. The returned channel is lazy
    /// and unbounded; cancelling `cancel` stops all per-queue consumers and
    /// the channel closes after they drain.
    async fn consume(
        &self,
        queues: &[Queue],
        options: &[ConsumeOption],
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<Box<dyn InboundEnvelope>>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_binding_matches_any_key() {
        let binding = QueueBinding::new("orders", vec![]);
        assert!(binding.matches("anything"));
        assert!(binding.matches(""));
    }

    #[test]
    fn binding_matches_listed_keys_only() {
        let binding = QueueBinding::new("orders", vec!["placed".to_string()]);
        assert!(binding.matches("placed"));
        assert!(!binding.matches("cancelled"));
    }
}
