//! Type registry for self-describing bus payloads.
//!
//! Every payload travelling on the bus is identified by a [`GroupKind`]
//! pair. The [`TypeRegistry`] is the only component that maps those wire
//! identifiers to constructible Rust types: decoders consult it, encoders
//! stamp the pair into the envelope. Registration happens during startup;
//! reads are lock-free afterwards.
//!
//! There is no process-wide singleton. A registry is an explicit value,
//! constructed at startup and injected into the codec, the store and the
//! saga handlers, which keeps tests deterministic (one registry per test).

use crate::saga::Saga;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// Two-part wire identifier of a payload type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    /// An empty kind never resolves to a registered type.
    pub fn has_empty_kind(&self) -> bool {
        self.kind.is_empty()
    }
}

impl std::fmt::Display for GroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.group, self.kind)
    }
}

/// A typed bus payload.
///
/// The declared constants are the type's own metadata; they are what the
/// codec writes into the envelope and what [`TypeRegistry::register`]
/// indexes by. `Default` provides the fresh zero value the registry hands
/// out on [`TypeRegistry::load`].
pub trait Contract:
    Debug + Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const GROUP: &'static str;
    const KIND: &'static str;

    fn group_kind() -> GroupKind {
        GroupKind::new(Self::GROUP, Self::KIND)
    }
}

/// Object-safe erased view of a [`Contract`] value.
///
/// Implemented for every contract type via a blanket impl; user code never
/// implements this directly.
pub trait Payload: Any + Debug + Send + Sync {
    /// The (group, kind) pair declared by the concrete type.
    fn group_kind(&self) -> GroupKind;

    /// Serialize the payload fields to a JSON value.
    fn to_value(&self) -> Result<Value, serde_json::Error>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn clone_payload(&self) -> BoxedPayload;
}

/// An owned, type-erased payload.
pub type BoxedPayload = Box<dyn Payload>;

impl<T: Contract> Payload for T {
    fn group_kind(&self) -> GroupKind {
        <T as Contract>::group_kind()
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_payload(&self) -> BoxedPayload {
        Box::new(self.clone())
    }
}

impl Clone for BoxedPayload {
    fn clone(&self) -> Self {
        self.clone_payload()
    }
}

/// Downcast an erased payload to its concrete contract type.
pub fn payload_downcast<T: Contract>(payload: &dyn Payload) -> Option<&T> {
    payload.as_any().downcast_ref::<T>()
}

/// Errors from registry lookups.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("type {0} is not registered")]
    UnknownType(GroupKind),

    #[error("decoding payload {group_kind}: {source}")]
    Decode {
        group_kind: GroupKind,
        #[source]
        source: serde_json::Error,
    },
}

type Factory = Arc<dyn Fn() -> BoxedPayload + Send + Sync>;
type PayloadDecoder = Arc<dyn Fn(Value) -> Result<BoxedPayload, serde_json::Error> + Send + Sync>;
type SagaDecoder = Arc<dyn Fn(Value) -> Result<Box<dyn Saga>, serde_json::Error> + Send + Sync>;

struct Entry {
    factory: Factory,
    decode: PayloadDecoder,
}

/// Maps [`GroupKind`] pairs to payload factories and decoders.
#[derive(Default)]
pub struct TypeRegistry {
    entries: DashMap<GroupKind, Entry>,
    sagas: DashMap<GroupKind, SagaDecoder>,
}

impl Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.entries.len())
            .field("sagas", &self.sagas.len())
            .finish()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload type. Duplicate registrations are idempotent.
    pub fn register<T: Contract>(&self) {
        self.entries.entry(<T as Contract>::group_kind()).or_insert_with(|| Entry {
            factory: Arc::new(|| Box::new(T::default())),
            decode: Arc::new(|value| {
                serde_json::from_value::<T>(value).map(|t| Box::new(t) as BoxedPayload)
            }),
        });
    }

    /// Register a saga type: its payload entry plus a decoder producing the
    /// saga behavior object, so stores can reconstruct instances by name.
    pub fn register_saga<S: Saga + Contract>(&self) {
        self.register::<S>();
        self.sagas.entry(<S as Contract>::group_kind()).or_insert_with(|| {
            Arc::new(|value| {
                serde_json::from_value::<S>(value).map(|s| Box::new(s) as Box<dyn Saga>)
            })
        });
    }

    /// Construct a fresh, zeroed payload for a registered pair.
    pub fn load(&self, group_kind: &GroupKind) -> Result<BoxedPayload, RegistryError> {
        let entry = self
            .entries
            .get(group_kind)
            .ok_or_else(|| RegistryError::UnknownType(group_kind.clone()))?;
        Ok((entry.factory)())
    }

    /// Deserialize `value` into a fresh payload of the registered type.
    pub fn decode_value(
        &self,
        group_kind: &GroupKind,
        value: Value,
    ) -> Result<BoxedPayload, RegistryError> {
        let entry = self
            .entries
            .get(group_kind)
            .ok_or_else(|| RegistryError::UnknownType(group_kind.clone()))?;
        (entry.decode)(value).map_err(|source| RegistryError::Decode {
            group_kind: group_kind.clone(),
            source,
        })
    }

    /// Deserialize `value` into a saga behavior object.
    pub fn decode_saga_value(
        &self,
        group_kind: &GroupKind,
        value: Value,
    ) -> Result<Box<dyn Saga>, RegistryError> {
        let decode = self
            .sagas
            .get(group_kind)
            .ok_or_else(|| RegistryError::UnknownType(group_kind.clone()))?;
        (decode)(value).map_err(|source| RegistryError::Decode {
            group_kind: group_kind.clone(),
            source,
        })
    }

    pub fn contains(&self, group_kind: &GroupKind) -> bool {
        self.entries.contains_key(group_kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        count: u32,
    }

    impl Contract for Ping {
        const GROUP: &'static str = "test";
        const KIND: &'static str = "Ping";
    }

    #[test]
    fn load_returns_fresh_zero_value() {
        let registry = TypeRegistry::new();
        registry.register::<Ping>();

        let payload = registry.load(&<Ping as Contract>::group_kind()).unwrap();
        let ping = payload_downcast::<Ping>(payload.as_ref()).unwrap();
        assert_eq!(ping, &Ping::default());
    }

    #[test]
    fn load_unknown_type_fails() {
        let registry = TypeRegistry::new();
        let err = registry
            .load(&GroupKind::new("test", "Nope"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownType(_)));
    }

    #[test]
    fn duplicate_registration_is_idempotent() {
        let registry = TypeRegistry::new();
        registry.register::<Ping>();
        registry.register::<Ping>();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn decode_value_builds_typed_payload() {
        let registry = TypeRegistry::new();
        registry.register::<Ping>();

        let payload = registry
            .decode_value(&<Ping as Contract>::group_kind(), json!({"count": 7}))
            .unwrap();
        let ping = payload_downcast::<Ping>(payload.as_ref()).unwrap();
        assert_eq!(ping.count, 7);
    }

    #[test]
    fn decode_value_surfaces_serde_errors() {
        let registry = TypeRegistry::new();
        registry.register::<Ping>();

        let err = registry
            .decode_value(&<Ping as Contract>::group_kind(), json!({"count": "not a number"}))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Decode { .. }));
    }

    #[test]
    fn boxed_payload_clone_preserves_value() {
        let payload: BoxedPayload = Box::new(Ping { count: 3 });
        let cloned = payload.clone();
        assert_eq!(
            payload_downcast::<Ping>(cloned.as_ref()).unwrap().count,
            3
        );
    }
}
