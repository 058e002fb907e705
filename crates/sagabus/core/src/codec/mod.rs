//! Wire codec for self-describing payloads.
//!
//! Marshal stamps the payload's `(group, kind)` into the JSON object under
//! the `groupKind` key; unmarshal reads it back, asks the [`TypeRegistry`]
//! for a fresh value of that type and deserializes the remaining fields
//! into it. Payloads with an empty kind or an unregistered pair are
//! rejected.

use crate::registry::{BoxedPayload, GroupKind, Payload, RegistryError, TypeRegistry};
use serde_json::Value;
use std::sync::Arc;

/// Key under which the wire discriminator is stored in the payload object.
pub const GROUP_KIND_FIELD: &str = "groupKind";

/// Errors from encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The envelope names a pair the registry does not know (or the kind is
    /// empty). Transient if the registry is populated later.
    #[error("kind {0} is not registered")]
    UnregisteredKind(GroupKind),

    /// The envelope body is not a well-formed self-describing object.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Payloads must serialize to JSON objects so the discriminator can be
    /// stamped next to their fields.
    #[error("payload {0} does not serialize to a JSON object")]
    NotAnObject(GroupKind),

    #[error("serializing payload {group_kind}: {source}")]
    Serialize {
        group_kind: GroupKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("decoding payload into {group_kind}: {source}")]
    Deserialize {
        group_kind: GroupKind,
        #[source]
        source: serde_json::Error,
    },
}

impl From<RegistryError> for CodecError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownType(gk) => CodecError::UnregisteredKind(gk),
            RegistryError::Decode { group_kind, source } => CodecError::Deserialize {
                group_kind,
                source,
            },
        }
    }
}

/// Encodes and decodes payload bytes for the transports.
pub trait MessageCodec: Send + Sync {
    /// Content type advertised in the envelope headers.
    fn content_type(&self) -> &'static str;

    fn encode(&self, payload: &dyn Payload) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, body: &[u8]) -> Result<BoxedPayload, CodecError>;
}

/// Read the `groupKind` discriminator out of a self-describing JSON value.
///
/// Fails with [`CodecError::MalformedEnvelope`] when the field is missing
/// or malformed, and with [`CodecError::UnregisteredKind`] when the kind is
/// empty.
pub fn group_kind_of_value(value: &Value) -> Result<GroupKind, CodecError> {
    let field = value
        .get(GROUP_KIND_FIELD)
        .ok_or_else(|| CodecError::MalformedEnvelope(format!("missing {GROUP_KIND_FIELD}")))?;
    let group_kind: GroupKind = serde_json::from_value(field.clone())
        .map_err(|e| CodecError::MalformedEnvelope(format!("invalid {GROUP_KIND_FIELD}: {e}")))?;
    if group_kind.has_empty_kind() {
        return Err(CodecError::UnregisteredKind(group_kind));
    }
    Ok(group_kind)
}

/// JSON codec over a type registry.
pub struct JsonMessageCodec {
    registry: Arc<TypeRegistry>,
}

impl JsonMessageCodec {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    /// Serialize a payload to its self-describing JSON object.
    pub fn encode_value(&self, payload: &dyn Payload) -> Result<Value, CodecError> {
        let group_kind = payload.group_kind();
        let value = payload.to_value().map_err(|source| CodecError::Serialize {
            group_kind: group_kind.clone(),
            source,
        })?;
        let mut object = match value {
            Value::Object(object) => object,
            _ => return Err(CodecError::NotAnObject(group_kind)),
        };
        object.insert(
            GROUP_KIND_FIELD.to_string(),
            serde_json::json!({"group": group_kind.group, "kind": group_kind.kind}),
        );
        Ok(Value::Object(object))
    }

    /// Decode a self-describing JSON object back into a typed payload.
    pub fn decode_value(&self, value: Value) -> Result<BoxedPayload, CodecError> {
        let group_kind = group_kind_of_value(&value)?;
        let fields = strip_discriminator(value);
        Ok(self.registry.decode_value(&group_kind, fields)?)
    }
}

fn strip_discriminator(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.remove(GROUP_KIND_FIELD);
            Value::Object(object)
        }
        other => other,
    }
}

impl MessageCodec for JsonMessageCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, payload: &dyn Payload) -> Result<Vec<u8>, CodecError> {
        let value = self.encode_value(payload)?;
        serde_json::to_vec(&value).map_err(|source| CodecError::Serialize {
            group_kind: payload.group_kind(),
            source,
        })
    }

    fn decode(&self, body: &[u8]) -> Result<BoxedPayload, CodecError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| CodecError::MalformedEnvelope(e.to_string()))?;
        if !value.is_object() {
            return Err(CodecError::MalformedEnvelope(
                "payload is not a JSON object".to_string(),
            ));
        }
        self.decode_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Contract, payload_downcast};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
        amount: i64,
    }

    impl Contract for OrderPlaced {
        const GROUP: &'static str = "test";
        const KIND: &'static str = "OrderPlaced";
    }

    fn codec() -> JsonMessageCodec {
        let registry = Arc::new(TypeRegistry::new());
        registry.register::<OrderPlaced>();
        JsonMessageCodec::new(registry)
    }

    #[test]
    fn encode_then_decode_yields_equal_value() {
        let codec = codec();
        let original = OrderPlaced {
            order_id: "o-17".to_string(),
            amount: 250,
        };

        let bytes = codec.encode(&original).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(
            payload_downcast::<OrderPlaced>(decoded.as_ref()).unwrap(),
            &original
        );
    }

    #[test]
    fn encode_stamps_the_discriminator() {
        let codec = codec();
        let bytes = codec.encode(&OrderPlaced::default()).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(
            value.get(GROUP_KIND_FIELD),
            Some(&json!({"group": "test", "kind": "OrderPlaced"}))
        );
    }

    #[test]
    fn decode_with_empty_kind_fails_as_unregistered() {
        let codec = codec();
        let body = json!({
            "groupKind": {"group": "test", "kind": ""},
            "order_id": "o-1",
            "amount": 1,
        });

        let err = codec
            .decode(serde_json::to_vec(&body).unwrap().as_slice())
            .unwrap_err();
        assert!(matches!(err, CodecError::UnregisteredKind(_)));
    }

    #[test]
    fn decode_unknown_pair_fails_as_unregistered() {
        let codec = codec();
        let body = json!({
            "groupKind": {"group": "test", "kind": "Nope"},
        });

        let err = codec
            .decode(serde_json::to_vec(&body).unwrap().as_slice())
            .unwrap_err();
        assert!(matches!(err, CodecError::UnregisteredKind(_)));
    }

    #[test]
    fn decode_without_discriminator_is_malformed() {
        let codec = codec();
        let err = codec.decode(br#"{"order_id": "o-1"}"#).unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope(_)));
    }

    #[test]
    fn decode_invalid_json_is_malformed() {
        let codec = codec();
        let err = codec.decode(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope(_)));
    }

    #[test]
    fn decode_non_object_is_malformed() {
        let codec = codec();
        let err = codec.decode(b"[1, 2, 3]").unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope(_)));
    }
}
