//! Aggregate reconstruction from snapshots and event replay.

use std::sync::Arc;

use cqrskit_core::{
    Aggregate, AggregateId, Event, GenericAggregate, HistoryEntry, Message, MessageBus, TypeTag,
    UserId,
};
use cqrskit_store::{EventStore, SnapshotStore, StoreError, StreamEvent};

use crate::registry::Registry;

/// Rebuilds aggregates: snapshot seed, canonical replay, optional queued
/// overlay for one user.
///
/// Reconstruction never fails the caller. Wiring gaps and store errors are
/// reported as messages and the best aggregate built so far is returned, so
/// a broken stream degrades to a partial view instead of an error path.
pub struct AggregateFactory {
    registry: Arc<Registry>,
    event_store: Arc<dyn EventStore>,
    snapshot_store: Arc<dyn SnapshotStore>,
    message_bus: Arc<MessageBus>,
}

impl AggregateFactory {
    pub fn new(
        registry: Arc<Registry>,
        event_store: Arc<dyn EventStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        message_bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            registry,
            event_store,
            snapshot_store,
            message_bus,
        }
    }

    /// Rebuild every known aggregate, optionally of one type.
    ///
    /// Canonical state only; no queued overlay.
    pub fn find_aggregates(
        &self,
        aggregate_type: Option<&TypeTag>,
    ) -> Result<Vec<Box<dyn Aggregate>>, StoreError> {
        let first_rows = self.event_store.find_aggregates(aggregate_type)?;
        Ok(first_rows
            .iter()
            .map(|row| self.build(row.uuid, &row.aggregate_type, None, None))
            .collect())
    }

    /// Rebuild one aggregate up to `max_version` (`None` = latest).
    ///
    /// With a `user`, that user's queued events at versions past the canonical
    /// stream are layered on top, yielding the speculative view the user would
    /// see after publishing.
    pub fn build(
        &self,
        uuid: AggregateId,
        aggregate_type: &TypeTag,
        max_version: Option<u64>,
        user: Option<UserId>,
    ) -> Box<dyn Aggregate> {
        let mut aggregate = match self.registry.new_aggregate(aggregate_type, uuid) {
            Ok(aggregate) => aggregate,
            Err(e) => {
                self.message_bus.dispatch(
                    Message::new(e.to_string(), e.status_code())
                        .for_aggregate(uuid)
                        .with_error(e.into()),
                );
                Box::new(GenericAggregate::new(uuid))
            }
        };

        let mut min_version = None;
        match self.snapshot_store.find(uuid, max_version) {
            Ok(Some(snapshot)) => match aggregate.restore_snapshot(snapshot.state.clone()) {
                Ok(()) => {
                    let meta = aggregate.meta_mut();
                    meta.version = snapshot.version;
                    meta.snapshot_version = Some(snapshot.version);
                    meta.stream_version = snapshot.version;
                    meta.created = snapshot.aggregate_created;
                    meta.modified = snapshot.aggregate_modified;
                    meta.history = snapshot.history;
                    min_version = Some(snapshot.version + 1);
                }
                Err(e) => {
                    tracing::warn!(
                        aggregate_uuid = %uuid,
                        version = snapshot.version,
                        error = %e,
                        "unreadable snapshot, falling back to full replay",
                    );
                    // State may be partially written; start from scratch.
                    if let Ok(fresh) = self.registry.new_aggregate(aggregate_type, uuid) {
                        aggregate = fresh;
                    }
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    aggregate_uuid = %uuid,
                    error = %e,
                    "snapshot lookup failed, falling back to full replay",
                );
            }
        }

        match self.event_store.find(uuid, max_version, min_version) {
            Ok(stream) => {
                let (rebuilt, _) = self.rebuild(aggregate, &stream);
                aggregate = rebuilt;
            }
            Err(e) => {
                self.message_bus.dispatch(
                    Message::new(e.to_string(), e.status_code())
                        .for_aggregate(uuid)
                        .with_error(e.into()),
                );
            }
        }

        // Everything applied so far is durable.
        let stream_version = aggregate.meta().version;
        aggregate.meta_mut().stream_version = stream_version;

        if let Some(user) = user {
            match self
                .event_store
                .find_queued(uuid, user, max_version, Some(stream_version + 1))
            {
                Ok(queued) => {
                    let (rebuilt, _) = self.rebuild(aggregate, &queued);
                    aggregate = rebuilt;
                }
                Err(e) => {
                    self.message_bus.dispatch(
                        Message::new(e.to_string(), e.status_code())
                            .for_aggregate(uuid)
                            .with_error(e.into()),
                    );
                }
            }
        }

        aggregate
    }

    /// Apply stream rows in order, returning the aggregate and how many rows
    /// were applied.
    ///
    /// Stops at the first row whose event type has no registered replay
    /// handler: applying later events over a skipped one would corrupt state,
    /// so the aggregate stays at the last cleanly applied version.
    pub fn rebuild(
        &self,
        mut aggregate: Box<dyn Aggregate>,
        stream: &[StreamEvent],
    ) -> (Box<dyn Aggregate>, usize) {
        let mut applied = 0;
        for record in stream {
            if record.uuid != aggregate.meta().uuid {
                tracing::warn!(
                    aggregate_uuid = %aggregate.meta().uuid,
                    row_uuid = %record.uuid,
                    "skipping foreign stream row",
                );
                continue;
            }

            let handler = match self.registry.replay_handler(&record.event_type) {
                Ok(handler) => handler,
                Err(e) => {
                    self.message_bus.dispatch(
                        Message::new(e.to_string(), e.status_code())
                            .for_aggregate(record.uuid)
                            .with_error(e.into()),
                    );
                    break;
                }
            };

            aggregate = handler.execute(&record.to_event(), aggregate);

            let meta = aggregate.meta_mut();
            if meta.created.is_none() {
                meta.created = Some(record.created);
            }
            meta.modified = Some(record.created);
            meta.version = record.version;
            meta.history.push(HistoryEntry {
                user: record.user,
                version: record.version,
                message: record.message.clone(),
                created: record.created,
                payload: record.payload.clone(),
            });
            applied += 1;
        }
        (aggregate, applied)
    }

    /// Record a freshly minted event on the aggregate.
    ///
    /// Only bookkeeping moves: the version advances and the event joins the
    /// pending buffer. State catches up on the next rebuild; pending events
    /// are speculative until saved.
    pub fn apply(&self, aggregate: &mut dyn Aggregate, event: Event) {
        let meta = aggregate.meta_mut();
        meta.version = event.version;
        meta.pending_events.push(event);
    }
}
