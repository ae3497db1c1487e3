//! Event publication: canonical persistence or speculative queueing.

use std::sync::Arc;

use cqrskit_core::{AggregateId, Event, Message, MessageBus, StatusCode};
use cqrskit_store::{EventStore, QueuedEvent, StreamEvent};

use crate::command::Command;
use crate::command_bus::CommandBus;
use crate::notify::{AggregateUpdated, UpdateChannel};
use crate::registry::Registry;

/// Publishes the events a dispatch cycle produced.
///
/// Two destinations: the canonical stream (normal dispatch) or the per-user
/// queue (speculative dispatch). Either way the store decides acceptance via
/// its `(uuid, version)` constraint; success messages are only dispatched
/// after the save commits, so a positive verdict always means durable.
pub struct EventBus {
    registry: Arc<Registry>,
    event_store: Arc<dyn EventStore>,
    message_bus: Arc<MessageBus>,
    updates: UpdateChannel,
}

impl EventBus {
    pub fn new(
        registry: Arc<Registry>,
        event_store: Arc<dyn EventStore>,
        message_bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            registry,
            event_store,
            message_bus,
            updates: UpdateChannel::new(),
        }
    }

    /// Channel broadcasting canonical aggregate updates.
    pub fn updates(&self) -> &UpdateChannel {
        &self.updates
    }

    /// Persist (or queue) events, report outcomes, run listeners.
    ///
    /// On save failure nothing downstream runs: no success messages, no
    /// listeners, no update notifications. Queued publication additionally
    /// requires every event to carry a user; otherwise nothing is staged.
    pub fn publish(
        &self,
        events: Vec<Event>,
        queue_events: bool,
        command_bus: &CommandBus,
        command: Option<&Command>,
    ) {
        if events.is_empty() {
            return;
        }

        let mut stream_rows = Vec::with_capacity(events.len());
        if queue_events {
            // Validate the whole batch before staging any of it.
            let mut queued = Vec::with_capacity(events.len());
            for event in &events {
                match QueuedEvent::new(StreamEvent::from_event(event)) {
                    Ok(entry) => queued.push(entry),
                    Err(_) => {
                        self.message_bus.dispatch(
                            Message::new("Cannot queue events without a user", StatusCode::Error)
                                .for_command(event.command_uuid)
                                .for_aggregate(event.aggregate_uuid),
                        );
                        return;
                    }
                }
            }
            for entry in queued {
                self.event_store.queue(entry);
            }
        } else {
            for event in &events {
                let row = StreamEvent::from_event(event);
                self.event_store.add(row.clone());
                stream_rows.push(row);
            }
        }

        if let Err(e) = self.event_store.save() {
            let mut message = Message::new(e.to_string(), e.status_code());
            if let Some(command) = command {
                message = message.for_command(command.uuid());
            }
            if let Some(first) = events.first() {
                message = message.for_aggregate(first.aggregate_uuid);
            }
            self.message_bus.dispatch(message.with_error(e.into()));
            return;
        }

        for event in &events {
            let text = if queue_events {
                format!("Queued event: {}", event.message)
            } else {
                format!("Persisted event: {}", event.message)
            };
            self.message_bus.dispatch(
                Message::new(text, StatusCode::Ok)
                    .for_command(event.command_uuid)
                    .for_aggregate(event.aggregate_uuid)
                    .with_context(event.payload.clone()),
            );
        }

        self.invoke_listeners(&events, command_bus, command);

        if !queue_events {
            self.send_aggregate_updates(&stream_rows);
        }
    }

    /// Promote queued events to the canonical stream.
    ///
    /// Listeners never re-run here; they already ran when the events were
    /// queued. The promotion inherits the optimistic concurrency check, so a
    /// queue that went stale fails the first save and stays in place.
    pub fn publish_queued(&self, queued: Vec<QueuedEvent>) -> bool {
        if queued.is_empty() {
            return true;
        }

        let mut rows = Vec::with_capacity(queued.len());
        for entry in &queued {
            let row = entry.stream().clone();
            self.event_store.add(row.clone());
            rows.push(row);
        }
        if let Err(e) = self.event_store.save() {
            self.message_bus
                .dispatch(Message::new(e.to_string(), e.status_code()).with_error(e.into()));
            return false;
        }

        self.send_aggregate_updates(&rows);

        for entry in queued {
            self.event_store.remove(entry);
        }
        if let Err(e) = self.event_store.save() {
            self.message_bus
                .dispatch(Message::new(e.to_string(), e.status_code()).with_error(e.into()));
            return false;
        }
        true
    }

    /// For each event run its declared listener, then the command callback.
    ///
    /// Listener failures are isolated: they are logged and reported as error
    /// messages but never undo the already-persisted events.
    fn invoke_listeners(
        &self,
        events: &[Event],
        command_bus: &CommandBus,
        command: Option<&Command>,
    ) {
        for event in events {
            self.run_declared_listener(event, command_bus);

            if let Some(command) = command {
                if let Some(callback) = command.listener() {
                    if let Err(e) = callback(command_bus, event) {
                        tracing::warn!(
                            command_uuid = %command.uuid(),
                            error = %e,
                            "command callback failed",
                        );
                        let text = format!("command callback failed: {e}");
                        self.message_bus.dispatch(
                            Message::new(text, StatusCode::Error)
                                .for_command(command.uuid())
                                .for_aggregate(event.aggregate_uuid)
                                .with_error(e),
                        );
                    }
                }
            }
        }
    }

    fn run_declared_listener(&self, event: &Event, command_bus: &CommandBus) {
        let def = match self.registry.event_def(&event.event_type) {
            Ok(def) => def,
            Err(e) => {
                self.message_bus.dispatch(
                    Message::new(e.to_string(), e.status_code())
                        .for_command(event.command_uuid)
                        .for_aggregate(event.aggregate_uuid)
                        .with_error(e.into()),
                );
                return;
            }
        };
        let listener_tag = match &def.listener {
            Some(tag) => tag.clone(),
            None => return,
        };
        let listener = match self.registry.resolve_listener(&listener_tag) {
            Ok(listener) => listener,
            Err(e) => {
                self.message_bus.dispatch(
                    Message::new(e.to_string(), e.status_code())
                        .for_command(event.command_uuid)
                        .for_aggregate(event.aggregate_uuid)
                        .with_error(e.into()),
                );
                return;
            }
        };
        if let Err(e) = listener.handle(command_bus, event) {
            tracing::warn!(
                event_type = %event.event_type,
                error = %e,
                "event listener failed",
            );
            self.message_bus.dispatch(
                Message::new(format!("listener failed: {e}"), StatusCode::Error)
                    .for_command(event.command_uuid)
                    .for_aggregate(event.aggregate_uuid)
                    .with_error(e),
            );
        }
    }

    /// Notify subscribers once per touched aggregate, carrying its last
    /// persisted event.
    fn send_aggregate_updates(&self, rows: &[StreamEvent]) {
        let mut latest: Vec<(AggregateId, &StreamEvent)> = Vec::new();
        for row in rows {
            match latest.iter_mut().find(|(uuid, _)| *uuid == row.uuid) {
                Some(entry) => entry.1 = row,
                None => latest.push((row.uuid, row)),
            }
        }
        for (_, row) in latest {
            self.updates.publish(AggregateUpdated {
                event: row.to_event(),
            });
        }
    }
}
