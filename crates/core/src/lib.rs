//! `cqrskit-core` — data model and contracts of the event-sourcing runtime.
//!
//! This crate contains **pure in-process** primitives (no persistence or
//! orchestration concerns): typed identifiers, the closed status-code set,
//! error kinds, immutable events, the aggregate capability contract and the
//! per-cycle message bus. Persistence lives in `cqrskit-store`, orchestration
//! in `cqrskit-runtime`.

pub mod aggregate;
pub mod error;
pub mod event;
pub mod id;
pub mod message;
pub mod status;

pub use aggregate::{Aggregate, AggregateMeta, GenericAggregate, HistoryEntry, SNAPSHOT_INTERVAL};
pub use error::{ContractKind, InvalidIdError, TypeMismatchError, ValidationError};
pub use event::Event;
pub use id::{AggregateId, CommandId, TypeTag, UserId};
pub use message::{Message, MessageBus, RaisedError};
pub use status::StatusCode;
