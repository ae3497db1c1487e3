//! Snapshot boundary.

use std::sync::Arc;

use cqrskit_core::{Aggregate, AggregateId};

use crate::error::StoreError;
use crate::record::Snapshot;

/// Best-effort snapshot persistence.
///
/// Snapshots are an optimization, never a source of truth: `save` reports
/// failures through the message bus and logging instead of failing the
/// caller, and an unreadable snapshot degrades to a full replay.
pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot at or below `max_version` (`None` = latest overall).
    fn find(
        &self,
        uuid: AggregateId,
        max_version: Option<u64>,
    ) -> Result<Option<Snapshot>, StoreError>;

    /// Capture the aggregate's current canonical state and persist it.
    fn save(&self, aggregate: &dyn Aggregate);
}

impl<S> SnapshotStore for Arc<S>
where
    S: SnapshotStore + ?Sized,
{
    fn find(
        &self,
        uuid: AggregateId,
        max_version: Option<u64>,
    ) -> Result<Option<Snapshot>, StoreError> {
        (**self).find(uuid, max_version)
    }

    fn save(&self, aggregate: &dyn Aggregate) {
        (**self).save(aggregate)
    }
}
