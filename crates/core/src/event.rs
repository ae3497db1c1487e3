//! Immutable domain facts.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::{AggregateId, CommandId, TypeTag, UserId};

/// A fact describing a state change that already happened.
///
/// `version` is the aggregate version *after* applying this event; events for
/// one aggregate carry strictly increasing versions. The type tags tie the
/// fact back to its aggregate type and, through the registry, to the handler
/// that applies it during replay and the listener that reacts to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: TypeTag,
    pub aggregate_type: TypeTag,
    pub aggregate_uuid: AggregateId,
    pub command_uuid: CommandId,
    pub version: u64,
    pub user: Option<UserId>,
    pub payload: JsonValue,
    /// Human-readable description, e.g. `"Page Created"`.
    pub message: String,
}
