//! Listener contract: reactions to published events.

use cqrskit_core::Event;

use crate::command_bus::CommandBus;

/// Side effect reacting to one event type, e.g. follow-up commands or
/// notifications.
///
/// Listeners run once per event at publication time, queued or not;
/// promoting a queued event later never re-runs them. A failing listener is
/// isolated into a message, the dispatch verdict stands.
pub trait Listener: Send + Sync {
    fn handle(&self, command_bus: &CommandBus, event: &Event) -> anyhow::Result<()>;
}
