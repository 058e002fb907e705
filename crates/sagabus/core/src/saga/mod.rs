//! Saga runtime: state model, behavior trait, handlers, store and mutex
//! ports.
//!
//! A saga is a long-running, persistent, message-driven state machine. One
//! concrete execution is a [`SagaInstance`]; its behavior lives in a type
//! implementing [`Saga`], reconstructed by name through the type registry.

pub mod contracts;
pub mod context;
pub mod control;
pub mod handler;
pub mod instance;
pub mod mutex;
pub mod status;
pub mod store;

pub use context::{Delivery, SagaContext};
pub use contracts::{
    CompensateSagaCommand, RecoverSagaCommand, SYSTEM_SAGA_GROUP, SagaChildCompletedEvent,
    SagaCompletedEvent, StartSagaCommand, register_system_contracts,
};
pub use control::SagaControlHandler;
pub use handler::SagaEventsHandler;
pub use instance::{HistoryAttributes, HistoryEvent, SagaInstance};
pub use mutex::{HeldLock, MutexError, RELEASE_GRACE, SagaMutex};
pub use status::{SagaStatus, StatusError, Transition};
pub use store::{InstanceFilter, SagaStore, StoreError, effective_filters};

use crate::message::{Headers, SAGA_UID_HEADER};
use crate::registry::{BoxedPayload, GroupKind, Payload};
use async_trait::async_trait;

/// Result of saga-authored code. Errors abort the turn; the envelope is not
/// acked and the broker redelivers.
pub type SagaResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Behavior of a saga, implemented alongside [`Contract`] on the payload
/// type that holds its business state.
///
/// [`Contract`]: crate::registry::Contract
#[async_trait]
pub trait Saga: Payload {
    /// Initialize the in-memory handler table. Pure and idempotent; called
    /// once per turn before dispatch.
    fn init(&mut self);

    /// The `(group, kind)` pairs this saga reacts to. An incoming event
    /// outside this table is logged and recorded, not an error.
    fn event_handlers(&self) -> Vec<GroupKind>;

    /// Handle one event from the table. `event` is a fresh copy of the
    /// incoming payload.
    async fn handle(&mut self, ctx: &mut SagaContext<'_>, event: BoxedPayload) -> SagaResult;

    /// Invoked when the instance starts.
    async fn start(&mut self, ctx: &mut SagaContext<'_>) -> SagaResult;

    /// Invoked when the instance switches into compensation.
    async fn compensate(&mut self, ctx: &mut SagaContext<'_>) -> SagaResult {
        let _ = ctx;
        Ok(())
    }

    /// Invoked when the instance is recovered after an operator command.
    async fn recover(&mut self, ctx: &mut SagaContext<'_>) -> SagaResult {
        let _ = ctx;
        Ok(())
    }
}

/// Extract the saga UID routing a message to its instance.
pub fn saga_uid_from_headers(headers: &Headers) -> Option<String> {
    headers
        .get(SAGA_UID_HEADER)
        .filter(|uid| !uid.is_empty())
        .map(str::to_string)
}

/// Stamp the saga UID into outgoing headers, overriding any present value.
pub fn stamp_saga_uid(headers: &mut Headers, saga_uid: &str) {
    headers.set(SAGA_UID_HEADER, saga_uid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saga_uid_roundtrip_through_headers() {
        let mut headers = Headers::new();
        assert_eq!(saga_uid_from_headers(&headers), None);

        stamp_saga_uid(&mut headers, "s-1");
        assert_eq!(saga_uid_from_headers(&headers), Some("s-1".to_string()));

        stamp_saga_uid(&mut headers, "s-2");
        assert_eq!(saga_uid_from_headers(&headers), Some("s-2".to_string()));
    }

    #[test]
    fn empty_saga_uid_header_counts_as_missing() {
        let mut headers = Headers::new();
        headers.set(SAGA_UID_HEADER, "");
        assert_eq!(saga_uid_from_headers(&headers), None);
    }
}
