//! # sagabus-core
//!
//! Core saga orchestration engine with zero infrastructure dependencies.
//!
//! The engine coordinates long-running, multi-step business transactions as
//! persistent state machines (saga instances) that react to events and
//! dispatch commands over an asynchronous message bus.
//!
//! ## Modules
//!
//! - [`registry`]: [`TypeRegistry`], the mapping from wire identifiers to
//!   constructible payloads
//! - [`message`]: envelopes, headers and the typed message model
//! - [`codec`]: the self-describing wire codec
//! - [`transport`]: the broker-agnostic transport port
//! - [`endpoint`]: outgoing fan-out by group/kind
//! - [`subscriber`]: the bounded worker dispatcher and consume loop
//! - [`execution`]: per-message execution context and error dispositions
//! - [`saga`]: the saga state model, handlers, store and mutex ports
//! - [`config`]: environment-based configuration loaders
//!
//! Infrastructure bindings live in sibling crates: `sagabus-local`
//! (in-process transport), `sagabus-nats` (NATS), `sagabus-pg`
//! (PostgreSQL store and mutex) and `sagabus-testing` (in-memory ports and
//! fixtures).

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod execution;
pub mod message;
pub mod registry;
pub mod saga;
pub mod subscriber;
pub mod transport;

pub use codec::{CodecError, JsonMessageCodec, MessageCodec, group_kind_of_value};
pub use config::EnvConfig;
pub use endpoint::{
    DeliveryOptions, Endpoint, EndpointError, EndpointRouter, TransportEndpoint,
};
pub use execution::{
    Disposition, HandlerError, MessageExecutionCtx, MessageHandler, MessageProcessor, Processor,
    ProcessorError,
};
pub use message::{
    CONTENT_TYPE_HEADER, DELAY_MS_HEADER, Headers, OutboundMessage, ReceivedMessage,
    SAGA_UID_HEADER,
};
pub use registry::{
    BoxedPayload, Contract, GroupKind, Payload, RegistryError, TypeRegistry, payload_downcast,
};
pub use saga::{
    CompensateSagaCommand, Delivery, HeldLock, HistoryAttributes, HistoryEvent, InstanceFilter,
    MutexError, RecoverSagaCommand, SYSTEM_SAGA_GROUP, Saga, SagaChildCompletedEvent,
    SagaCompletedEvent, SagaContext, SagaControlHandler, SagaEventsHandler, SagaInstance,
    SagaMutex, SagaResult, SagaStatus, SagaStore, StartSagaCommand, StatusError, StoreError,
    register_system_contracts, saga_uid_from_headers, stamp_saga_uid,
};
pub use subscriber::{
    Subscriber, SubscriberConfig, SubscriberError, SubscriberState, WorkerDispatcher, WorkerSlot,
};
pub use transport::{
    ConsumeOption, Destination, InboundEnvelope, OutboundEnvelope, Queue, QueueBinding,
    SendOption, Topic, Transport, TransportError,
};
