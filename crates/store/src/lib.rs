//! `cqrskit-store` — persistence boundary of the event-sourcing runtime.
//!
//! Event streams, the per-user speculative queue and snapshots, behind
//! storage-agnostic traits with an in-memory backend (tests/dev) and a
//! Postgres backend (production).

pub mod error;
pub mod event_store;
pub mod in_memory;
pub mod postgres;
pub mod record;
pub mod snapshot_store;

pub use error::StoreError;
pub use event_store::EventStore;
pub use in_memory::{InMemoryEventStore, InMemorySnapshotStore};
pub use postgres::{PostgresEventStore, PostgresSnapshotStore, setup_schema};
pub use record::{QueuedEvent, Snapshot, StreamEvent};
pub use snapshot_store::SnapshotStore;
