//! Row shapes persisted by the stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use cqrskit_core::{Aggregate, AggregateId, CommandId, Event, HistoryEntry, TypeTag, UserId};

use crate::error::StoreError;

/// One row of the canonical event stream.
///
/// Same content as the [`Event`] it was persisted from, plus the write
/// timestamp. The `(uuid, version)` pair is unique across the stream; that
/// constraint is the optimistic concurrency check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub uuid: AggregateId,
    pub command_uuid: CommandId,
    pub version: u64,
    pub created: DateTime<Utc>,
    pub event_type: TypeTag,
    pub aggregate_type: TypeTag,
    pub user: Option<UserId>,
    pub payload: JsonValue,
    pub message: String,
}

impl StreamEvent {
    /// Wrap a domain event for persistence, stamping the write time.
    pub fn from_event(event: &Event) -> Self {
        Self {
            uuid: event.aggregate_uuid,
            command_uuid: event.command_uuid,
            version: event.version,
            created: Utc::now(),
            event_type: event.event_type.clone(),
            aggregate_type: event.aggregate_type.clone(),
            user: event.user,
            payload: event.payload.clone(),
            message: event.message.clone(),
        }
    }

    /// Rebuild the domain event this row was persisted from.
    pub fn to_event(&self) -> Event {
        Event {
            event_type: self.event_type.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_uuid: self.uuid,
            command_uuid: self.command_uuid,
            version: self.version,
            user: self.user,
            payload: self.payload.clone(),
            message: self.message.clone(),
        }
    }
}

/// One row of the speculative queue: a stream row bound to the user who may
/// later publish or discard it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    user: UserId,
    stream: StreamEvent,
}

impl QueuedEvent {
    /// Queue rows always belong to a concrete user.
    pub fn new(stream: StreamEvent) -> Result<Self, StoreError> {
        let user = stream
            .user
            .ok_or_else(|| StoreError::backend("queue", "queued event carries no user"))?;
        Ok(Self { user, stream })
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn stream(&self) -> &StreamEvent {
        &self.stream
    }

    pub fn into_stream(self) -> StreamEvent {
        self.stream
    }
}

/// Point-in-time aggregate state for bounded replay.
///
/// `version` is the canonical stream version the state was captured at;
/// restoring seeds the aggregate there and replay continues at `version + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub uuid: AggregateId,
    pub version: u64,
    pub aggregate_type: TypeTag,
    pub state: JsonValue,
    pub aggregate_created: Option<DateTime<Utc>>,
    pub aggregate_modified: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub history: Vec<HistoryEntry>,
}

impl Snapshot {
    /// Capture an aggregate at its current stream version.
    ///
    /// Callers snapshot canonical builds only; state layered on top of the
    /// stream (queued or pending events) has no place in a snapshot.
    pub fn of(aggregate: &dyn Aggregate) -> Result<Self, serde_json::Error> {
        let meta = aggregate.meta();
        Ok(Self {
            uuid: meta.uuid,
            version: meta.stream_version,
            aggregate_type: aggregate.aggregate_type(),
            state: aggregate.snapshot_state()?,
            aggregate_created: meta.created,
            aggregate_modified: meta.modified,
            created: Utc::now(),
            history: meta.history.clone(),
        })
    }
}
