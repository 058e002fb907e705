//! Message execution: one in-flight envelope turn.
//!
//! The [`MessageProcessor`] decodes an inbound envelope, looks up the
//! handler registered for the payload's group/kind and invokes it with a
//! [`MessageExecutionCtx`]. Errors carry a [`Disposition`] deciding whether
//! the envelope is acked, rejected or left for broker redelivery.

use crate::codec::{CodecError, MessageCodec};
use crate::endpoint::{DeliveryOptions, EndpointError, EndpointRouter};
use crate::message::{OutboundMessage, ReceivedMessage};
use crate::registry::{GroupKind, RegistryError};
use crate::saga::{MutexError, StatusError, StoreError};
use crate::transport::InboundEnvelope;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// What the subscriber does with the envelope after a failed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Consume the envelope: redelivery would change nothing.
    Ack,
    /// Negatively acknowledge; the broker decides between requeue and dead
    /// letter.
    Reject,
    /// Neither ack nor reject; the broker redelivers.
    Leave,
}

/// Errors from a saga handler turn.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The envelope carries no `saga_uid` header.
    #[error("message {0} carries no saga_uid header")]
    MissingSagaUid(String),

    #[error("saga {0} not found")]
    SagaNotFound(String),

    /// The instance already reached a terminal status; the envelope is
    /// consumed without redelivery.
    #[error("saga {uid} already finished with status {status}")]
    SagaFinished {
        uid: String,
        status: crate::saga::SagaStatus,
    },

    /// The control handler received a payload it is not subscribed for.
    #[error("unexpected control payload {0}")]
    UnexpectedPayload(GroupKind),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Mutex(#[from] MutexError),

    #[error("sending delivery: {0}")]
    Send(#[from] EndpointError),

    /// Error returned by saga-authored code.
    #[error("saga handler: {0}")]
    Saga(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn disposition(&self) -> Disposition {
        match self {
            // Replays against finished sagas and duplicate start commands
            // are duplicate broker deliveries; consume them.
            HandlerError::SagaFinished { .. } => Disposition::Ack,
            HandlerError::Store(StoreError::Duplicate(_)) => Disposition::Ack,
            HandlerError::MissingSagaUid(_) | HandlerError::SagaNotFound(_) => Disposition::Reject,
            _ => Disposition::Leave,
        }
    }
}

/// Errors from processing one envelope.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("no handler subscribed for {0}")]
    NoHandler(GroupKind),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl ProcessorError {
    pub fn disposition(&self) -> Disposition {
        match self {
            ProcessorError::Codec(_) | ProcessorError::NoHandler(_) => Disposition::Leave,
            ProcessorError::Handler(err) => err.disposition(),
        }
    }
}

/// Wraps a single in-flight message: accessors, the turn's cancellation
/// token and send helpers. The subscriber enforces the turn deadline
/// around the whole `process` call and cancels the token when it expires.
pub struct MessageExecutionCtx<'a> {
    message: &'a ReceivedMessage,
    router: &'a EndpointRouter,
    cancel: &'a CancellationToken,
}

impl<'a> MessageExecutionCtx<'a> {
    pub fn new(
        message: &'a ReceivedMessage,
        router: &'a EndpointRouter,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            message,
            router,
            cancel,
        }
    }

    pub fn message(&self) -> &ReceivedMessage {
        self.message
    }

    /// The turn's cancellation token, passed along to every blocking
    /// operation the handler performs.
    pub fn cancellation(&self) -> &CancellationToken {
        self.cancel
    }

    /// Fan the message out to every endpoint registered for its kind. Zero
    /// registered endpoints is legal and logged.
    pub async fn send(
        &self,
        message: OutboundMessage,
        options: DeliveryOptions,
    ) -> Result<(), EndpointError> {
        let group_kind = message.group_kind();
        let endpoints = self.router.endpoints_for(&group_kind);
        if endpoints.is_empty() {
            warn!(%group_kind, "no endpoints registered for outgoing message");
            return Ok(());
        }
        for endpoint in endpoints {
            endpoint.send(message.clone(), &options, self.cancel).await?;
        }
        Ok(())
    }
}

/// Handles one decoded message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: MessageExecutionCtx<'_>) -> Result<(), HandlerError>;
}

/// Dispatches inbound envelopes to handlers. `cancel` is the turn's
/// cancellation token, threaded into every blocking operation.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(
        &self,
        envelope: &dyn InboundEnvelope,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessorError>;
}

/// Default processor: codec + handler table + endpoint router.
pub struct MessageProcessor {
    codec: Arc<dyn MessageCodec>,
    router: Arc<EndpointRouter>,
    handlers: DashMap<GroupKind, Arc<dyn MessageHandler>>,
}

impl MessageProcessor {
    pub fn new(codec: Arc<dyn MessageCodec>, router: Arc<EndpointRouter>) -> Self {
        Self {
            codec,
            router,
            handlers: DashMap::new(),
        }
    }

    /// Subscribe a handler for a payload kind. The latest subscription for
    /// a kind wins.
    pub fn subscribe(&self, group_kind: GroupKind, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(group_kind, handler);
    }

    pub fn router(&self) -> &Arc<EndpointRouter> {
        &self.router
    }
}

#[async_trait]
impl Processor for MessageProcessor {
    async fn process(
        &self,
        envelope: &dyn InboundEnvelope,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessorError> {
        let payload = self.codec.decode(envelope.body())?;
        let group_kind = payload.group_kind();

        let handler = self
            .handlers
            .get(&group_kind)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| ProcessorError::NoHandler(group_kind.clone()))?;

        let message = ReceivedMessage::new(
            envelope.uid(),
            envelope.origin(),
            envelope.headers().clone(),
            payload,
        );
        let ctx = MessageExecutionCtx::new(&message, &self.router, cancel);
        handler.handle(ctx).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonMessageCodec;
    use crate::message::Headers;
    use crate::registry::{Contract, TypeRegistry};
    use crate::transport::TransportError;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    struct Ping;

    impl Contract for Ping {
        const GROUP: &'static str = "test";
        const KIND: &'static str = "Ping";
    }

    struct StaticEnvelope {
        body: Vec<u8>,
        headers: Headers,
    }

    #[async_trait]
    impl InboundEnvelope for StaticEnvelope {
        fn uid(&self) -> &str {
            "m-1"
        }

        fn origin(&self) -> &str {
            "test-queue"
        }

        fn headers(&self) -> &Headers {
            &self.headers
        }

        fn body(&self) -> &[u8] {
            &self.body
        }

        async fn ack(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn reject(&self, _requeue: bool) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct OkHandler;

    #[async_trait]
    impl MessageHandler for OkHandler {
        async fn handle(&self, ctx: MessageExecutionCtx<'_>) -> Result<(), HandlerError> {
            assert_eq!(ctx.message().uid(), "m-1");
            Ok(())
        }
    }

    fn processor() -> (MessageProcessor, Vec<u8>) {
        let registry = Arc::new(TypeRegistry::new());
        registry.register::<Ping>();
        let codec = Arc::new(JsonMessageCodec::new(Arc::clone(&registry)));
        let body = codec.encode(&Ping).unwrap();
        let processor = MessageProcessor::new(codec, Arc::new(EndpointRouter::new()));
        (processor, body)
    }

    #[tokio::test]
    async fn dispatches_to_the_subscribed_handler() {
        let (processor, body) = processor();
        processor.subscribe(<Ping as Contract>::group_kind(), Arc::new(OkHandler));

        let envelope = StaticEnvelope {
            body,
            headers: Headers::new(),
        };
        processor
            .process(&envelope, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unsubscribed_kind_fails_with_no_handler() {
        let (processor, body) = processor();
        let envelope = StaticEnvelope {
            body,
            headers: Headers::new(),
        };

        let err = processor
            .process(&envelope, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::NoHandler(_)));
        assert_eq!(err.disposition(), Disposition::Leave);
    }

    #[tokio::test]
    async fn malformed_body_surfaces_codec_error() {
        let (processor, _) = processor();
        let envelope = StaticEnvelope {
            body: b"not json".to_vec(),
            headers: Headers::new(),
        };

        let err = processor
            .process(&envelope, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Codec(_)));
    }

    #[test]
    fn dispositions_follow_the_error_table() {
        assert_eq!(
            HandlerError::SagaFinished {
                uid: "s".to_string(),
                status: crate::saga::SagaStatus::Completed,
            }
            .disposition(),
            Disposition::Ack
        );
        assert_eq!(
            HandlerError::MissingSagaUid("m".to_string()).disposition(),
            Disposition::Reject
        );
        assert_eq!(
            HandlerError::SagaNotFound("s".to_string()).disposition(),
            Disposition::Reject
        );
        assert_eq!(
            HandlerError::Store(StoreError::Transient("io".to_string())).disposition(),
            Disposition::Leave
        );
        assert_eq!(
            HandlerError::Store(StoreError::Duplicate("s".to_string())).disposition(),
            Disposition::Ack
        );
    }
}
