//! Typed messages exchanged over the bus.
//!
//! A [`ReceivedMessage`] is a decoded incoming envelope: payload plus UID,
//! origin queue and headers. An [`OutboundMessage`] is a payload on its way
//! out. Headers always propagate by explicit copy; the engine clones the
//! incoming headers onto outgoing messages and rewrites `saga_uid`.

pub mod headers;

pub use headers::{CONTENT_TYPE_HEADER, DELAY_MS_HEADER, Headers, SAGA_UID_HEADER};

use crate::registry::{BoxedPayload, GroupKind};
use uuid::Uuid;

/// A decoded incoming message, bound to the envelope it arrived in.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    uid: String,
    origin: String,
    headers: Headers,
    payload: BoxedPayload,
}

impl ReceivedMessage {
    pub fn new(
        uid: impl Into<String>,
        origin: impl Into<String>,
        headers: Headers,
        payload: BoxedPayload,
    ) -> Self {
        Self {
            uid: uid.into(),
            origin: origin.into(),
            headers,
            payload,
        }
    }

    /// Unique message id assigned by the producer.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Queue the message was consumed from.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn payload(&self) -> &dyn crate::registry::Payload {
        self.payload.as_ref()
    }

    pub fn group_kind(&self) -> GroupKind {
        self.payload.group_kind()
    }
}

/// A message queued for publication.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    uid: String,
    headers: Headers,
    payload: BoxedPayload,
}

impl OutboundMessage {
    /// New message with empty headers and a fresh UID.
    pub fn new(payload: BoxedPayload) -> Self {
        Self::with_headers(payload, Headers::new())
    }

    /// New message carrying the given headers (callers copy the incoming
    /// envelope's headers here before overriding routing keys).
    pub fn with_headers(payload: BoxedPayload, headers: Headers) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            headers,
            payload,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn payload(&self) -> &dyn crate::registry::Payload {
        self.payload.as_ref()
    }

    pub fn group_kind(&self) -> GroupKind {
        self.payload.group_kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Contract;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    struct Ping;

    impl Contract for Ping {
        const GROUP: &'static str = "test";
        const KIND: &'static str = "Ping";
    }

    #[test]
    fn outbound_messages_get_unique_uids() {
        let a = OutboundMessage::new(Box::new(Ping));
        let b = OutboundMessage::new(Box::new(Ping));
        assert_ne!(a.uid(), b.uid());
    }

    #[test]
    fn group_kind_comes_from_the_payload() {
        let msg = OutboundMessage::new(Box::new(Ping));
        assert_eq!(msg.group_kind(), GroupKind::new("test", "Ping"));
    }
}
