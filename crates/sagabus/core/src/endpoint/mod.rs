//! Outgoing-side routing: payloads fan out to named endpoints.
//!
//! For every `(group, kind)` a set of [`Endpoint`]s is registered in the
//! [`EndpointRouter`]. An endpoint owns the translation from delivery
//! options (such as a delay) to transport-level headers.

use crate::codec::{CodecError, MessageCodec};
use crate::message::{DELAY_MS_HEADER, OutboundMessage};
use crate::registry::GroupKind;
use crate::transport::{Destination, OutboundEnvelope, SendOption, Transport, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Options applied to a single delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOptions {
    delay: Option<Duration>,
}

impl DeliveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the transport to delay the delivery.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }
}

/// Errors from sending through an endpoint.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("encoding outgoing message: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A named destination for outgoing messages.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        message: OutboundMessage,
        options: &DeliveryOptions,
        cancel: &CancellationToken,
    ) -> Result<(), EndpointError>;
}

/// Endpoint publishing through a [`Transport`] to a fixed destination.
///
/// Encodes the payload with the codec, stamps the content type and
/// translates the delay option into the `x-delay-ms` header.
pub struct TransportEndpoint {
    name: String,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn MessageCodec>,
    destination: Destination,
    send_options: Vec<SendOption>,
}

impl TransportEndpoint {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn MessageCodec>,
        destination: Destination,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            codec,
            destination,
            send_options: Vec::new(),
        }
    }

    /// Attach transport-level send options applied to every publish.
    pub fn with_send_options(mut self, options: Vec<SendOption>) -> Self {
        self.send_options = options;
        self
    }
}

#[async_trait]
impl Endpoint for TransportEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        message: OutboundMessage,
        options: &DeliveryOptions,
        cancel: &CancellationToken,
    ) -> Result<(), EndpointError> {
        let body = self.codec.encode(message.payload())?;

        let mut headers = message.headers().clone();
        headers.set(
            crate::message::CONTENT_TYPE_HEADER,
            self.codec.content_type(),
        );
        if let Some(delay) = options.delay() {
            headers.set(DELAY_MS_HEADER, delay.as_millis().to_string());
        }

        let envelope = OutboundEnvelope {
            uid: message.uid().to_string(),
            headers,
            body,
        };
        self.transport
            .send(&self.destination, envelope, &self.send_options, cancel)
            .await?;
        Ok(())
    }
}

/// Routes outgoing payloads to zero or more endpoints by their group/kind.
#[derive(Default)]
pub struct EndpointRouter {
    routes: DashMap<GroupKind, Vec<Arc<dyn Endpoint>>>,
}

impl EndpointRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint for a payload kind. The same kind may route to
    /// several endpoints; each send fans out to all of them.
    pub fn route(&self, group_kind: GroupKind, endpoint: Arc<dyn Endpoint>) {
        self.routes.entry(group_kind).or_default().push(endpoint);
    }

    pub fn endpoints_for(&self, group_kind: &GroupKind) -> Vec<Arc<dyn Endpoint>> {
        self.routes
            .get(group_kind)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn is_routed(&self, group_kind: &GroupKind) -> bool {
        self.routes
            .get(group_kind)
            .is_some_and(|e| !e.value().is_empty())
    }
}

impl std::fmt::Debug for EndpointRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRouter")
            .field("kinds", &self.routes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Contract;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    struct Ping;

    impl Contract for Ping {
        const GROUP: &'static str = "test";
        const KIND: &'static str = "Ping";
    }

    struct RecordingEndpoint {
        name: String,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Endpoint for RecordingEndpoint {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(
            &self,
            message: OutboundMessage,
            _options: &DeliveryOptions,
            _cancel: &CancellationToken,
        ) -> Result<(), EndpointError> {
            self.sent.lock().push(message.uid().to_string());
            Ok(())
        }
    }

    #[test]
    fn unrouted_kind_has_no_endpoints() {
        let router = EndpointRouter::new();
        assert!(router.endpoints_for(&<Ping as Contract>::group_kind()).is_empty());
        assert!(!router.is_routed(&<Ping as Contract>::group_kind()));
    }

    #[tokio::test]
    async fn send_fans_out_to_all_registered_endpoints() {
        let router = EndpointRouter::new();
        let first = Arc::new(RecordingEndpoint {
            name: "first".to_string(),
            sent: Mutex::new(vec![]),
        });
        let second = Arc::new(RecordingEndpoint {
            name: "second".to_string(),
            sent: Mutex::new(vec![]),
        });
        router.route(<Ping as Contract>::group_kind(), first.clone());
        router.route(<Ping as Contract>::group_kind(), second.clone());

        let message = OutboundMessage::new(Box::new(Ping));
        let cancel = CancellationToken::new();
        for endpoint in router.endpoints_for(&<Ping as Contract>::group_kind()) {
            endpoint
                .send(message.clone(), &DeliveryOptions::default(), &cancel)
                .await
                .unwrap();
        }

        assert_eq!(first.sent.lock().len(), 1);
        assert_eq!(second.sent.lock().len(), 1);
    }

    #[test]
    fn delivery_options_builder() {
        let options = DeliveryOptions::new().with_delay(Duration::from_secs(5));
        assert_eq!(options.delay(), Some(Duration::from_secs(5)));
        assert_eq!(DeliveryOptions::default().delay(), None);
    }
}
