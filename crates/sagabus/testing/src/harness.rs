//! Full-engine test harness over the in-process transport.

use crate::fixtures::{self, BarEvent, FlakyEvent, FooEvent, SlowEvent};
use crate::memory_mutex::InMemoryMutex;
use crate::memory_store::InMemorySagaStore;
use sagabus_core::codec::{CodecError, JsonMessageCodec, MessageCodec};
use sagabus_core::endpoint::{EndpointRouter, TransportEndpoint};
use sagabus_core::execution::{MessageProcessor, Processor};
use sagabus_core::message::Headers;
use sagabus_core::registry::{Contract, Payload, TypeRegistry};
use sagabus_core::saga::{
    CompensateSagaCommand, RecoverSagaCommand, SagaChildCompletedEvent, SagaCompletedEvent,
    SagaControlHandler, SagaEventsHandler, SagaMutex, SagaStore, StartSagaCommand,
};
use sagabus_core::subscriber::{Subscriber, SubscriberConfig, SubscriberError};
use sagabus_core::transport::{
    Destination, OutboundEnvelope, Queue, QueueBinding, Topic, Transport, TransportError,
};
use sagabus_local::MemoryTransport;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Topic all engine traffic is published to.
pub const MAIN_TOPIC: &str = "sagabus.events";
/// Queue the subscriber consumes.
pub const MAIN_QUEUE: &str = "sagabus-queue";
/// Topic carrying parent notifications.
pub const PARENT_TOPIC: &str = "sagabus.parent";
/// Queue bound to the parent topic, consumed by tests directly.
pub const PARENT_QUEUE: &str = "sagabus-parent-queue";
/// Topic carrying saga completion announcements.
pub const COMPLETED_TOPIC: &str = "sagabus.completed";
/// Queue bound to the completed topic, consumed by tests directly.
pub const COMPLETED_QUEUE: &str = "sagabus-completed-queue";

/// Install the test log subscriber once per process. Controlled by
/// `RUST_LOG`; repeat calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fully wired engine: memory transport, memory store and mutex, the
/// saga handlers subscribed for the demo and system contracts, and a
/// subscriber ready to run.
pub struct TestHarness {
    pub registry: Arc<TypeRegistry>,
    pub codec: Arc<JsonMessageCodec>,
    pub transport: Arc<MemoryTransport>,
    pub store: Arc<InMemorySagaStore>,
    pub mutex: Arc<InMemoryMutex>,
    pub processor: Arc<MessageProcessor>,
    pub subscriber: Arc<Subscriber>,
    pub cancel: CancellationToken,
}

impl TestHarness {
    pub async fn start(config: SubscriberConfig) -> Result<Self, TransportError> {
        init_test_logging();

        let registry = Arc::new(TypeRegistry::new());
        fixtures::register_demo_types(&registry);

        let cancel = CancellationToken::new();
        let codec = Arc::new(JsonMessageCodec::new(Arc::clone(&registry)));
        let transport = Arc::new(MemoryTransport::new());
        transport.connect(&cancel).await?;
        for (topic, queue) in [
            (MAIN_TOPIC, MAIN_QUEUE),
            (PARENT_TOPIC, PARENT_QUEUE),
            (COMPLETED_TOPIC, COMPLETED_QUEUE),
        ] {
            transport.declare_topic(&Topic::new(topic), &cancel).await?;
            transport
                .declare_queue(
                    &Queue::new(queue),
                    &[QueueBinding::new(topic, vec![])],
                    &cancel,
                )
                .await?;
        }

        let router = Arc::new(EndpointRouter::new());
        let main_endpoint = Arc::new(TransportEndpoint::new(
            "main",
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&codec) as Arc<dyn MessageCodec>,
            Destination::new(MAIN_TOPIC, ""),
        ));
        for kind in [
            <FooEvent as Contract>::group_kind(),
            <BarEvent as Contract>::group_kind(),
            <SlowEvent as Contract>::group_kind(),
            <FlakyEvent as Contract>::group_kind(),
        ] {
            router.route(kind, main_endpoint.clone());
        }
        let parent_endpoint = Arc::new(TransportEndpoint::new(
            "parent",
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&codec) as Arc<dyn MessageCodec>,
            Destination::new(PARENT_TOPIC, ""),
        ));
        router.route(<SagaChildCompletedEvent as Contract>::group_kind(), parent_endpoint);
        let completed_endpoint = Arc::new(TransportEndpoint::new(
            "completed",
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&codec) as Arc<dyn MessageCodec>,
            Destination::new(COMPLETED_TOPIC, ""),
        ));
        router.route(<SagaCompletedEvent as Contract>::group_kind(), completed_endpoint);

        let store = Arc::new(InMemorySagaStore::new(Arc::clone(&registry)));
        let mutex = Arc::new(InMemoryMutex::new());

        let processor = Arc::new(MessageProcessor::new(
            Arc::clone(&codec) as Arc<dyn MessageCodec>,
            Arc::clone(&router),
        ));

        let events_handler = Arc::new(SagaEventsHandler::new(
            Arc::clone(&store) as Arc<dyn SagaStore>,
            Arc::clone(&mutex) as Arc<dyn SagaMutex>,
        ));
        for kind in [
            <FooEvent as Contract>::group_kind(),
            <BarEvent as Contract>::group_kind(),
            <SlowEvent as Contract>::group_kind(),
            <FlakyEvent as Contract>::group_kind(),
        ] {
            processor.subscribe(kind, events_handler.clone());
        }

        let control_handler = Arc::new(SagaControlHandler::new(
            Arc::clone(&store) as Arc<dyn SagaStore>,
            Arc::clone(&mutex) as Arc<dyn SagaMutex>,
            Arc::clone(&registry),
        ));
        for kind in [
            <StartSagaCommand as Contract>::group_kind(),
            <CompensateSagaCommand as Contract>::group_kind(),
            <RecoverSagaCommand as Contract>::group_kind(),
        ] {
            processor.subscribe(kind, control_handler.clone());
        }

        let subscriber = Arc::new(Subscriber::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&processor) as Arc<dyn Processor>,
            config,
        ));

        Ok(Self {
            registry,
            codec,
            transport,
            store,
            mutex,
            processor,
            subscriber,
            cancel,
        })
    }

    /// Run the subscriber on the main queue in a background task.
    pub fn spawn(&self) -> JoinHandle<Result<(), SubscriberError>> {
        let subscriber = Arc::clone(&self.subscriber);
        let cancel = self.cancel.clone();
        tokio::spawn(async move { subscriber.run(cancel, vec![Queue::new(MAIN_QUEUE)]).await })
    }

    /// Encode and publish a payload to the main topic.
    pub async fn publish(
        &self,
        payload: &dyn Payload,
        headers: Headers,
    ) -> Result<(), PublishError> {
        let body = self.codec.encode(payload)?;
        self.transport
            .send(
                &Destination::new(MAIN_TOPIC, ""),
                OutboundEnvelope {
                    uid: Uuid::new_v4().to_string(),
                    headers,
                    body,
                },
                &[],
                &self.cancel,
            )
            .await?;
        Ok(())
    }
}

/// Errors from the harness publish helper.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
