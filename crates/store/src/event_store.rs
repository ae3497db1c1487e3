//! Event stream and queue boundary.

use std::sync::Arc;

use cqrskit_core::{AggregateId, TypeTag, UserId};

use crate::error::StoreError;
use crate::record::{QueuedEvent, StreamEvent};

/// A write staged in a handle, not yet committed.
#[derive(Debug, Clone)]
pub(crate) enum StagedOp {
    Append(StreamEvent),
    Queue(QueuedEvent),
    Remove {
        uuid: AggregateId,
        user: UserId,
        version: u64,
    },
}

/// Append-only event stream plus the per-user speculative queue.
///
/// ## Design Principles
///
/// - **No storage assumptions**: works with the in-memory implementation
///   (tests/dev) and the Postgres backend (production)
/// - **Optimistic locking**: the unique `(uuid, version)` constraint decides
///   save conflicts; there are no pessimistic locks
/// - **Append-only**: stream rows are never modified or deleted; only queue
///   rows can be removed
///
/// ## Staging
///
/// `add`, `queue` and `remove` stage work in the handle; nothing becomes
/// visible to readers until `save` commits the whole batch atomically. A
/// failed `save` leaves the tables untouched and drops the staged batch.
/// Hosts running dispatch cycles concurrently give each its own handle (see
/// `handle()` on the implementations); handles share the underlying tables.
///
/// ## Ordering
///
/// `find` and `find_queued` return rows in ascending version order. Version
/// bounds are inclusive; `min_version = None` means from the start,
/// `max_version = None` means to the end.
pub trait EventStore: Send + Sync {
    /// First row (version 1) of every stream, optionally filtered by
    /// aggregate type, ordered by creation time.
    fn find_aggregates(
        &self,
        aggregate_type: Option<&TypeTag>,
    ) -> Result<Vec<StreamEvent>, StoreError>;

    /// Canonical rows of one stream within the inclusive version bounds.
    fn find(
        &self,
        uuid: AggregateId,
        max_version: Option<u64>,
        min_version: Option<u64>,
    ) -> Result<Vec<StreamEvent>, StoreError>;

    /// Queued rows of one stream for one user within the inclusive bounds.
    fn find_queued(
        &self,
        uuid: AggregateId,
        user: UserId,
        max_version: Option<u64>,
        min_version: Option<u64>,
    ) -> Result<Vec<StreamEvent>, StoreError>;

    /// All queued rows of one user on one stream, as queue entries ready for
    /// promotion or removal.
    fn queued_objects(
        &self,
        uuid: AggregateId,
        user: UserId,
    ) -> Result<Vec<QueuedEvent>, StoreError>;

    /// Stage a canonical append.
    fn add(&self, event: StreamEvent);

    /// Stage a queue insert.
    fn queue(&self, event: QueuedEvent);

    /// Stage a queue delete.
    fn remove(&self, event: QueuedEvent);

    /// Commit the staged batch atomically.
    ///
    /// Fails with [`StoreError::Conflict`] when a staged append collides with
    /// an existing or sibling `(uuid, version)` slot; no partial batch is
    /// ever applied.
    fn save(&self) -> Result<(), StoreError>;

    /// Drop every queued row of one user on one stream.
    ///
    /// Stages the deletes and commits the handle's batch.
    fn discard_queued(&self, uuid: AggregateId, user: UserId) -> Result<(), StoreError> {
        for queued in self.queued_objects(uuid, user)? {
            self.remove(queued);
        }
        self.save()
    }

    /// Drop the user's queued rows at or above `version`.
    fn discard_latest_queued(
        &self,
        uuid: AggregateId,
        user: UserId,
        version: u64,
    ) -> Result<(), StoreError> {
        for queued in self.queued_objects(uuid, user)? {
            if queued.stream().version >= version {
                self.remove(queued);
            }
        }
        self.save()
    }
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn find_aggregates(
        &self,
        aggregate_type: Option<&TypeTag>,
    ) -> Result<Vec<StreamEvent>, StoreError> {
        (**self).find_aggregates(aggregate_type)
    }

    fn find(
        &self,
        uuid: AggregateId,
        max_version: Option<u64>,
        min_version: Option<u64>,
    ) -> Result<Vec<StreamEvent>, StoreError> {
        (**self).find(uuid, max_version, min_version)
    }

    fn find_queued(
        &self,
        uuid: AggregateId,
        user: UserId,
        max_version: Option<u64>,
        min_version: Option<u64>,
    ) -> Result<Vec<StreamEvent>, StoreError> {
        (**self).find_queued(uuid, user, max_version, min_version)
    }

    fn queued_objects(
        &self,
        uuid: AggregateId,
        user: UserId,
    ) -> Result<Vec<QueuedEvent>, StoreError> {
        (**self).queued_objects(uuid, user)
    }

    fn add(&self, event: StreamEvent) {
        (**self).add(event)
    }

    fn queue(&self, event: QueuedEvent) {
        (**self).queue(event)
    }

    fn remove(&self, event: QueuedEvent) {
        (**self).remove(event)
    }

    fn save(&self) -> Result<(), StoreError> {
        (**self).save()
    }

    fn discard_queued(&self, uuid: AggregateId, user: UserId) -> Result<(), StoreError> {
        (**self).discard_queued(uuid, user)
    }

    fn discard_latest_queued(
        &self,
        uuid: AggregateId,
        user: UserId,
        version: u64,
    ) -> Result<(), StoreError> {
        (**self).discard_latest_queued(uuid, user, version)
    }
}
