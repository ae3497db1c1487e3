//! `cqrskit-runtime` — command execution pipeline of the event-sourcing
//! runtime.
//!
//! Composes the data model (`cqrskit-core`) with the stores (`cqrskit-store`)
//! into the dispatch cycle: a [`CommandBus`] resolves wiring through the
//! [`Registry`], rebuilds aggregates via the [`AggregateFactory`], and hands
//! produced events to the [`EventBus`] for persistence or queueing.

pub mod command;
pub mod command_bus;
pub mod event_bus;
pub mod factory;
pub mod handler;
pub mod listener;
pub mod notify;
pub mod registry;

mod integration_tests;

pub use command::{Command, CommandCallback};
pub use command_bus::CommandBus;
pub use event_bus::EventBus;
pub use factory::AggregateFactory;
pub use handler::Handler;
pub use listener::Listener;
pub use notify::{AggregateUpdated, UpdateChannel, UpdateSubscription};
pub use registry::{AggregateCtor, CommandDef, EventDef, Registry, RegistryBuilder};
