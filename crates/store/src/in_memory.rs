//! In-memory store backends.
//!
//! Intended for tests/dev. Not optimized for performance.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use cqrskit_core::{Aggregate, AggregateId, Message, MessageBus, StatusCode, TypeTag, UserId};

use crate::error::StoreError;
use crate::event_store::{EventStore, StagedOp};
use crate::record::{QueuedEvent, Snapshot, StreamEvent};
use crate::snapshot_store::SnapshotStore;

#[derive(Debug, Default)]
struct Tables {
    stream: HashMap<AggregateId, Vec<StreamEvent>>,
    queue: HashMap<AggregateId, Vec<QueuedEvent>>,
}

/// In-memory event store.
///
/// Tables sit behind an `Arc`, the staging buffer does not: `handle()` hands
/// out independent staging buffers over the same data, so concurrent dispatch
/// cycles cannot commit each other's half-staged batches.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    tables: Arc<RwLock<Tables>>,
    staged: Mutex<Vec<StagedOp>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new handle over the same tables with its own staging buffer.
    pub fn handle(&self) -> Self {
        Self {
            tables: Arc::clone(&self.tables),
            staged: Mutex::new(Vec::new()),
        }
    }

    fn stage(&self, op: StagedOp) {
        // Staging must stay usable after a panicking sibling thread.
        self.staged
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(op);
    }

    fn tables(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables.read().map_err(|_| StoreError::LockPoisoned)
    }
}

impl EventStore for InMemoryEventStore {
    fn find_aggregates(
        &self,
        aggregate_type: Option<&TypeTag>,
    ) -> Result<Vec<StreamEvent>, StoreError> {
        let tables = self.tables()?;
        let mut firsts: Vec<StreamEvent> = tables
            .stream
            .values()
            .filter_map(|rows| rows.iter().find(|e| e.version == 1))
            .filter(|e| aggregate_type.map_or(true, |t| &e.aggregate_type == t))
            .cloned()
            .collect();
        firsts.sort_by_key(|e| e.created);
        Ok(firsts)
    }

    fn find(
        &self,
        uuid: AggregateId,
        max_version: Option<u64>,
        min_version: Option<u64>,
    ) -> Result<Vec<StreamEvent>, StoreError> {
        let tables = self.tables()?;
        let mut rows: Vec<StreamEvent> = tables
            .stream
            .get(&uuid)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| {
                        max_version.map_or(true, |max| e.version <= max)
                            && min_version.map_or(true, |min| e.version >= min)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|e| e.version);
        Ok(rows)
    }

    fn find_queued(
        &self,
        uuid: AggregateId,
        user: UserId,
        max_version: Option<u64>,
        min_version: Option<u64>,
    ) -> Result<Vec<StreamEvent>, StoreError> {
        let tables = self.tables()?;
        let mut rows: Vec<StreamEvent> = tables
            .queue
            .get(&uuid)
            .map(|queued| {
                queued
                    .iter()
                    .filter(|q| q.user() == user)
                    .map(QueuedEvent::stream)
                    .filter(|e| {
                        max_version.map_or(true, |max| e.version <= max)
                            && min_version.map_or(true, |min| e.version >= min)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|e| e.version);
        Ok(rows)
    }

    fn queued_objects(
        &self,
        uuid: AggregateId,
        user: UserId,
    ) -> Result<Vec<QueuedEvent>, StoreError> {
        let tables = self.tables()?;
        let mut rows: Vec<QueuedEvent> = tables
            .queue
            .get(&uuid)
            .map(|queued| queued.iter().filter(|q| q.user() == user).cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|q| q.stream().version);
        Ok(rows)
    }

    fn add(&self, event: StreamEvent) {
        self.stage(StagedOp::Append(event));
    }

    fn queue(&self, event: QueuedEvent) {
        self.stage(StagedOp::Queue(event));
    }

    fn remove(&self, event: QueuedEvent) {
        self.stage(StagedOp::Remove {
            uuid: event.stream().uuid,
            user: event.user(),
            version: event.stream().version,
        });
    }

    fn save(&self) -> Result<(), StoreError> {
        let batch: Vec<StagedOp> = {
            let mut staged = self
                .staged
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *staged)
        };
        if batch.is_empty() {
            return Ok(());
        }

        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;

        // Validate the whole batch before mutating anything.
        let mut fresh_stream: HashSet<(AggregateId, u64)> = HashSet::new();
        let mut fresh_queue: HashSet<(AggregateId, u64, UserId)> = HashSet::new();
        for op in &batch {
            match op {
                StagedOp::Append(event) => {
                    let taken = tables
                        .stream
                        .get(&event.uuid)
                        .is_some_and(|rows| rows.iter().any(|e| e.version == event.version));
                    if taken || !fresh_stream.insert((event.uuid, event.version)) {
                        return Err(StoreError::Conflict {
                            uuid: event.uuid,
                            version: event.version,
                        });
                    }
                }
                StagedOp::Queue(queued) => {
                    let row = queued.stream();
                    let taken = tables.queue.get(&row.uuid).is_some_and(|rows| {
                        rows.iter().any(|q| {
                            q.user() == queued.user() && q.stream().version == row.version
                        })
                    });
                    if taken || !fresh_queue.insert((row.uuid, row.version, queued.user())) {
                        return Err(StoreError::Conflict {
                            uuid: row.uuid,
                            version: row.version,
                        });
                    }
                }
                StagedOp::Remove { .. } => {}
            }
        }

        for op in batch {
            match op {
                StagedOp::Append(event) => {
                    tables.stream.entry(event.uuid).or_default().push(event);
                }
                StagedOp::Queue(queued) => {
                    tables
                        .queue
                        .entry(queued.stream().uuid)
                        .or_default()
                        .push(queued);
                }
                StagedOp::Remove {
                    uuid,
                    user,
                    version,
                } => {
                    if let Some(rows) = tables.queue.get_mut(&uuid) {
                        rows.retain(|q| !(q.user() == user && q.stream().version == version));
                    }
                }
            }
        }
        Ok(())
    }
}

/// In-memory snapshot store.
///
/// Save failures become messages on the bus, matching the best-effort
/// snapshot contract.
#[derive(Debug)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<AggregateId, Vec<Snapshot>>>,
    message_bus: Arc<MessageBus>,
}

impl InMemorySnapshotStore {
    pub fn new(message_bus: Arc<MessageBus>) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            message_bus,
        }
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn find(
        &self,
        uuid: AggregateId,
        max_version: Option<u64>,
    ) -> Result<Option<Snapshot>, StoreError> {
        let snapshots = self.snapshots.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(snapshots.get(&uuid).and_then(|all| {
            all.iter()
                .filter(|s| max_version.map_or(true, |max| s.version <= max))
                .max_by_key(|s| s.version)
                .cloned()
        }))
    }

    fn save(&self, aggregate: &dyn Aggregate) {
        let uuid = aggregate.meta().uuid;
        let snapshot = match Snapshot::of(aggregate) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(uuid = %uuid, error = %e, "snapshot serialization failed");
                self.message_bus.dispatch(
                    Message::new(format!("snapshot serialization failed: {e}"), StatusCode::Error)
                        .for_aggregate(uuid)
                        .with_error(e.into()),
                );
                return;
            }
        };

        let mut snapshots = match self.snapshots.write() {
            Ok(snapshots) => snapshots,
            Err(_) => {
                self.message_bus.dispatch(
                    Message::new("snapshot store lock poisoned", StatusCode::Error)
                        .for_aggregate(uuid),
                );
                return;
            }
        };

        let rows = snapshots.entry(snapshot.uuid).or_default();
        if rows.iter().any(|s| s.version == snapshot.version) {
            self.message_bus.dispatch(
                Message::new(
                    format!(
                        "snapshot already exists at version {} for aggregate {}",
                        snapshot.version, snapshot.uuid
                    ),
                    StatusCode::Error,
                )
                .for_aggregate(snapshot.uuid),
            );
            return;
        }
        tracing::debug!(uuid = %snapshot.uuid, version = snapshot.version, "snapshot saved");
        rows.push(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cqrskit_core::{AggregateMeta, CommandId, GenericAggregate};
    use serde_json::json;

    fn stream_event(uuid: AggregateId, version: u64, user: Option<UserId>) -> StreamEvent {
        StreamEvent {
            uuid,
            command_uuid: CommandId::new(),
            version,
            created: Utc::now(),
            event_type: TypeTag::from("page.created"),
            aggregate_type: TypeTag::from("page"),
            user,
            payload: json!({ "version": version }),
            message: "Page Created".into(),
        }
    }

    #[test]
    fn staged_rows_are_invisible_until_save() {
        let store = InMemoryEventStore::new();
        let uuid = AggregateId::new();

        store.add(stream_event(uuid, 1, None));
        assert!(store.find(uuid, None, None).unwrap().is_empty());

        store.save().unwrap();
        let rows = store.find(uuid, None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version, 1);
    }

    #[test]
    fn version_bounds_are_inclusive_and_ordered() {
        let store = InMemoryEventStore::new();
        let uuid = AggregateId::new();
        for version in [3, 1, 4, 2, 5] {
            store.add(stream_event(uuid, version, None));
        }
        store.save().unwrap();

        let rows = store.find(uuid, Some(4), Some(2)).unwrap();
        let versions: Vec<u64> = rows.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![2, 3, 4]);
    }

    #[test]
    fn conflicting_save_discards_the_whole_batch() {
        let store = InMemoryEventStore::new();
        let uuid = AggregateId::new();
        store.add(stream_event(uuid, 1, None));
        store.save().unwrap();

        // One fresh row, one colliding row. Nothing may land.
        store.add(stream_event(uuid, 2, None));
        store.add(stream_event(uuid, 1, None));
        assert!(matches!(
            store.save(),
            Err(StoreError::Conflict { version: 1, .. })
        ));
        assert_eq!(store.find(uuid, None, None).unwrap().len(), 1);

        // The failed batch is gone; saving again is a no-op.
        store.save().unwrap();
        assert_eq!(store.find(uuid, None, None).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_versions_within_one_batch_conflict() {
        let store = InMemoryEventStore::new();
        let uuid = AggregateId::new();
        store.add(stream_event(uuid, 1, None));
        store.add(stream_event(uuid, 1, None));
        assert!(store.save().is_err());
        assert!(store.find(uuid, None, None).unwrap().is_empty());
    }

    #[test]
    fn handles_share_tables_but_not_staging() {
        let store = InMemoryEventStore::new();
        let other = store.handle();
        let uuid = AggregateId::new();

        store.add(stream_event(uuid, 1, None));
        other.add(stream_event(uuid, 1, None));

        store.save().unwrap();
        // The other handle's identical row is still staged and now collides.
        assert!(other.save().is_err());
        assert_eq!(other.find(uuid, None, None).unwrap().len(), 1);
    }

    #[test]
    fn queue_is_scoped_by_user_and_version_bounds() {
        let store = InMemoryEventStore::new();
        let uuid = AggregateId::new();
        let alice = UserId::new();
        let bob = UserId::new();

        for version in 1..=3 {
            let event = stream_event(uuid, version, Some(alice));
            store.queue(QueuedEvent::new(event).unwrap());
        }
        store.queue(QueuedEvent::new(stream_event(uuid, 1, Some(bob))).unwrap());
        store.save().unwrap();

        assert_eq!(store.find_queued(uuid, alice, None, None).unwrap().len(), 3);
        assert_eq!(
            store.find_queued(uuid, alice, Some(2), Some(2)).unwrap().len(),
            1
        );
        assert_eq!(store.find_queued(uuid, bob, None, None).unwrap().len(), 1);
        // The canonical stream stays empty.
        assert!(store.find(uuid, None, None).unwrap().is_empty());
    }

    #[test]
    fn queued_event_requires_a_user() {
        let event = stream_event(AggregateId::new(), 1, None);
        assert!(QueuedEvent::new(event).is_err());
    }

    #[test]
    fn discard_queued_drops_only_that_users_rows() {
        let store = InMemoryEventStore::new();
        let uuid = AggregateId::new();
        let alice = UserId::new();
        let bob = UserId::new();

        store.queue(QueuedEvent::new(stream_event(uuid, 1, Some(alice))).unwrap());
        store.queue(QueuedEvent::new(stream_event(uuid, 2, Some(alice))).unwrap());
        store.queue(QueuedEvent::new(stream_event(uuid, 1, Some(bob))).unwrap());
        store.save().unwrap();

        store.discard_queued(uuid, alice).unwrap();
        assert!(store.find_queued(uuid, alice, None, None).unwrap().is_empty());
        assert_eq!(store.find_queued(uuid, bob, None, None).unwrap().len(), 1);
    }

    #[test]
    fn discard_latest_queued_threshold_is_inclusive() {
        let store = InMemoryEventStore::new();
        let uuid = AggregateId::new();
        let user = UserId::new();
        for version in 1..=4 {
            store.queue(QueuedEvent::new(stream_event(uuid, version, Some(user))).unwrap());
        }
        store.save().unwrap();

        store.discard_latest_queued(uuid, user, 3).unwrap();
        let versions: Vec<u64> = store
            .find_queued(uuid, user, None, None)
            .unwrap()
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn find_aggregates_returns_first_rows_filtered_by_type() {
        let store = InMemoryEventStore::new();
        let page = AggregateId::new();
        let other = AggregateId::new();

        store.add(stream_event(page, 1, None));
        store.add(stream_event(page, 2, None));
        let mut foreign = stream_event(other, 1, None);
        foreign.aggregate_type = TypeTag::from("order");
        store.add(foreign);
        store.save().unwrap();

        let pages = store.find_aggregates(Some(&TypeTag::from("page"))).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].uuid, page);
        assert_eq!(pages[0].version, 1);

        assert_eq!(store.find_aggregates(None).unwrap().len(), 2);
    }

    #[test]
    fn snapshot_find_respects_max_version() {
        let bus = Arc::new(MessageBus::new(false));
        let store = InMemorySnapshotStore::new(Arc::clone(&bus));
        let uuid = AggregateId::new();

        for version in [10, 20, 30] {
            let mut aggregate = GenericAggregate::new(uuid);
            aggregate.meta_mut().stream_version = version;
            store.save(&aggregate);
        }

        assert_eq!(store.find(uuid, None).unwrap().unwrap().version, 30);
        assert_eq!(store.find(uuid, Some(25)).unwrap().unwrap().version, 20);
        assert_eq!(store.find(uuid, Some(9)).unwrap(), None);
        assert!(bus.messages().is_empty());
    }

    #[test]
    fn duplicate_snapshot_version_is_reported_not_raised() {
        let bus = Arc::new(MessageBus::new(false));
        let store = InMemorySnapshotStore::new(Arc::clone(&bus));
        let uuid = AggregateId::new();

        let mut aggregate = GenericAggregate::new(uuid);
        aggregate.meta_mut().stream_version = 10;
        store.save(&aggregate);
        store.save(&aggregate);

        let messages = bus.messages_by_aggregate(uuid);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].code, StatusCode::Error);
        assert!(messages[0].message.contains("already exists"));
    }

    #[test]
    fn snapshot_carries_meta_and_history() {
        let bus = Arc::new(MessageBus::new(false));
        let store = InMemorySnapshotStore::new(bus);
        let uuid = AggregateId::new();

        let mut aggregate = GenericAggregate::new(uuid);
        let meta: &mut AggregateMeta = aggregate.meta_mut();
        meta.stream_version = 10;
        meta.version = 10;
        meta.created = Some(Utc::now());
        meta.history.push(cqrskit_core::HistoryEntry {
            user: None,
            version: 1,
            message: "Page Created".into(),
            created: Utc::now(),
            payload: json!({}),
        });
        store.save(&aggregate);

        let snapshot = store.find(uuid, None).unwrap().unwrap();
        assert_eq!(snapshot.version, 10);
        assert_eq!(snapshot.history.len(), 1);
        assert!(snapshot.aggregate_created.is_some());
    }
}
