//! System saga contracts.
//!
//! Commands and events the orchestrator itself understands, all carried in
//! the `systemSaga` group. Every contract carries at minimum the saga UID.

use crate::registry::{Contract, TypeRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Group of the system saga contracts.
pub const SYSTEM_SAGA_GROUP: &str = "systemSaga";

/// Creates a saga instance, persists it and starts it.
///
/// `saga` is the nested self-describing saga object, decoded through the
/// registry by the control handler.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSagaCommand {
    pub saga_uid: String,
    /// Empty when the saga has no parent.
    #[serde(default)]
    pub parent_uid: String,
    #[serde(default)]
    pub saga: Value,
}

impl Contract for StartSagaCommand {
    const GROUP: &'static str = SYSTEM_SAGA_GROUP;
    const KIND: &'static str = "StartSagaCommand";
}

/// Transitions a non-terminal instance to `Recovering` and replays it
/// through the saga's recover hook.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverSagaCommand {
    pub saga_uid: String,
}

impl Contract for RecoverSagaCommand {
    const GROUP: &'static str = SYSTEM_SAGA_GROUP;
    const KIND: &'static str = "RecoverSagaCommand";
}

/// Transitions an in-progress instance to `Compensating` and invokes the
/// compensation hook.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensateSagaCommand {
    pub saga_uid: String,
}

impl Contract for CompensateSagaCommand {
    const GROUP: &'static str = SYSTEM_SAGA_GROUP;
    const KIND: &'static str = "CompensateSagaCommand";
}

/// Emitted when an instance reaches terminal `Completed`.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCompletedEvent {
    pub saga_uid: String,
}

impl Contract for SagaCompletedEvent {
    const GROUP: &'static str = SYSTEM_SAGA_GROUP;
    const KIND: &'static str = "SagaCompletedEvent";
}

/// Emitted to the parent instance when a child saga completes. Both the
/// payload field and the `saga_uid` header carry the parent UID.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaChildCompletedEvent {
    pub saga_uid: String,
}

impl Contract for SagaChildCompletedEvent {
    const GROUP: &'static str = SYSTEM_SAGA_GROUP;
    const KIND: &'static str = "SagaChildCompletedEvent";
}

/// Register all system saga contracts in the given registry.
pub fn register_system_contracts(registry: &TypeRegistry) {
    registry.register::<StartSagaCommand>();
    registry.register::<RecoverSagaCommand>();
    registry.register::<CompensateSagaCommand>();
    registry.register::<SagaCompletedEvent>();
    registry.register::<SagaChildCompletedEvent>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GroupKind;
    use serde_json::json;

    #[test]
    fn all_contracts_register() {
        let registry = TypeRegistry::new();
        register_system_contracts(&registry);
        assert_eq!(registry.len(), 5);
        assert!(registry.contains(&GroupKind::new(SYSTEM_SAGA_GROUP, "StartSagaCommand")));
        assert!(registry.contains(&GroupKind::new(
            SYSTEM_SAGA_GROUP,
            "SagaChildCompletedEvent"
        )));
    }

    #[test]
    fn start_command_wire_shape() {
        let command: StartSagaCommand = serde_json::from_value(json!({
            "saga_uid": "s1",
            "parent_uid": "",
            "saga": {"groupKind": {"group": "demo", "kind": "Foo"}, "x": 1},
        }))
        .unwrap();

        assert_eq!(command.saga_uid, "s1");
        assert!(command.parent_uid.is_empty());
        assert_eq!(command.saga["x"], 1);
    }
}
