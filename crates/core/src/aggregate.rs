//! Aggregate capability contract and replay bookkeeping.

use std::any::Any;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::event::Event;
use crate::id::{AggregateId, TypeTag, UserId};

/// Snapshot cadence: a snapshot is due every this many canonical events.
pub const SNAPSHOT_INTERVAL: u64 = 10;

/// Compact record of one applied event, kept on the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub user: Option<UserId>,
    pub version: u64,
    pub message: String,
    pub created: DateTime<Utc>,
    pub payload: JsonValue,
}

/// Bookkeeping shared by every aggregate type.
///
/// `version` only ever increases and may run ahead of `stream_version`, the
/// durability watermark reached by canonical replay alone, when queued events
/// or fresh pending events are layered on top.
#[derive(Debug, Clone)]
pub struct AggregateMeta {
    pub uuid: AggregateId,
    pub version: u64,
    pub snapshot_version: Option<u64>,
    pub stream_version: u64,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub pending_events: Vec<Event>,
    pub history: Vec<HistoryEntry>,
}

impl AggregateMeta {
    pub fn new(uuid: AggregateId) -> Self {
        Self {
            uuid,
            version: 0,
            snapshot_version: None,
            stream_version: 0,
            created: None,
            modified: None,
            pending_events: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Hands pending events over to the publisher, leaving none behind.
    pub fn take_pending(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }
}

/// Capability contract every aggregate type satisfies.
///
/// Concrete aggregates embed an [`AggregateMeta`] and keep domain state in a
/// dedicated serde struct; `snapshot_state` and `restore_snapshot` form the
/// explicit serialization contract used by the snapshot store.
pub trait Aggregate: Send {
    /// Stable type tag, as registered and as persisted on every row.
    fn aggregate_type(&self) -> TypeTag;

    fn meta(&self) -> &AggregateMeta;

    fn meta_mut(&mut self) -> &mut AggregateMeta;

    /// Serialize the domain state (never the bookkeeping) for a snapshot row.
    fn snapshot_state(&self) -> Result<JsonValue, serde_json::Error>;

    /// Restore domain state from a value produced by [`Self::snapshot_state`].
    fn restore_snapshot(&mut self, state: JsonValue) -> Result<(), serde_json::Error>;

    /// Downcast support for handlers working on the concrete type.
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// True once enough canonical events accrued since the last snapshot.
    fn should_take_snapshot(&self) -> bool {
        let meta = self.meta();
        meta.stream_version >= meta.snapshot_version.unwrap_or(0) + SNAPSHOT_INTERVAL
    }
}

/// Fallback for unresolvable aggregate type tags.
///
/// Carries bookkeeping but no domain state, so lookups of a misregistered
/// type still return something inspectable instead of failing outright.
#[derive(Debug, Clone)]
pub struct GenericAggregate {
    meta: AggregateMeta,
}

impl GenericAggregate {
    pub fn new(uuid: AggregateId) -> Self {
        Self {
            meta: AggregateMeta::new(uuid),
        }
    }
}

impl Aggregate for GenericAggregate {
    fn aggregate_type(&self) -> TypeTag {
        TypeTag::from("generic")
    }

    fn meta(&self) -> &AggregateMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut AggregateMeta {
        &mut self.meta
    }

    fn snapshot_state(&self) -> Result<JsonValue, serde_json::Error> {
        Ok(JsonValue::Null)
    }

    fn restore_snapshot(&mut self, _state: JsonValue) -> Result<(), serde_json::Error> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
