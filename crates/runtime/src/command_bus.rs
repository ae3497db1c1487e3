//! Command execution pipeline (application-level orchestration).
//!
//! This module implements the **command dispatch pattern** for event-sourced
//! aggregates. It orchestrates the full cycle: resolving wiring, rebuilding
//! state, validating intent, minting events, persisting or queueing them, and
//! deriving the verdict.
//!
//! ## Command Execution Flow
//!
//! The `CommandBus` implements this pipeline:
//!
//! ```text
//! Command
//!   ↓
//! 1. Resolve wiring (command definition + handler, via the registry)
//!   ↓
//! 2. Rebuild aggregate (snapshot + replay; queued overlay when queueing)
//!   ↓
//! 3. Validate command, then gate on the anchored version
//!   ↓
//! 4. Mint the event (one version past the anchor) into the pending buffer
//!   ↓
//! 5. Publish (persist or queue, report outcomes, run listeners)
//!   ↓
//! 6. Verdict (first message correlated to the command decides)
//! ```
//!
//! ## Design Principles
//!
//! - **No storage assumptions**: composes the store traits, works with the
//!   in-memory backend in tests and Postgres in production
//! - **Failures become messages**: after wiring resolution, every outcome is
//!   reported on the message bus; the boolean verdict is derived, never thrown
//! - **Truthful verdicts**: success messages exist only for events a committed
//!   save made durable, so a `true` verdict always means persisted
//!
//! A bus serves one dispatch cycle at a time. Hosts running cycles
//! concurrently create one bus per worker, each with its own message bus and
//! store handle; the shared stream's `(uuid, version)` constraint arbitrates
//! racing writers.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use cqrskit_core::{
    Aggregate, AggregateId, CommandId, Message, MessageBus, StatusCode, TypeMismatchError,
    TypeTag, UserId,
};
use cqrskit_store::{EventStore, SnapshotStore};

use crate::command::Command;
use crate::event_bus::EventBus;
use crate::factory::AggregateFactory;
use crate::handler::Handler;
use crate::notify::UpdateSubscription;
use crate::registry::{CommandDef, Registry};

/// Front door of the runtime: turns commands into persisted events plus a
/// verdict.
pub struct CommandBus {
    registry: Arc<Registry>,
    factory: AggregateFactory,
    event_bus: EventBus,
    message_bus: Arc<MessageBus>,
}

impl CommandBus {
    pub fn new(
        registry: Arc<Registry>,
        event_store: Arc<dyn EventStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        message_bus: Arc<MessageBus>,
    ) -> Self {
        let factory = AggregateFactory::new(
            Arc::clone(&registry),
            Arc::clone(&event_store),
            snapshot_store,
            Arc::clone(&message_bus),
        );
        let event_bus = EventBus::new(
            Arc::clone(&registry),
            event_store,
            Arc::clone(&message_bus),
        );
        Self {
            registry,
            factory,
            event_bus,
            message_bus,
        }
    }

    pub fn factory(&self) -> &AggregateFactory {
        &self.factory
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn message_bus(&self) -> &MessageBus {
        &self.message_bus
    }

    /// Subscribe to canonical aggregate update notifications.
    pub fn subscribe_updates(&self) -> UpdateSubscription {
        self.event_bus.updates().subscribe()
    }

    /// Dispatch a command anchored at the aggregate's current version.
    ///
    /// Convenience over [`dispatch`](Self::dispatch): rebuilds the aggregate,
    /// reads its version, and anchors the command there. Prepare a
    /// [`Command`] yourself to pin a version or attach a callback.
    ///
    /// Fails fast only on an unknown command type; every other outcome comes
    /// back as the verdict plus messages.
    pub fn execute(
        &self,
        command_type: impl Into<TypeTag>,
        aggregate_uuid: AggregateId,
        payload: JsonValue,
        user: Option<UserId>,
        queue_events: bool,
    ) -> Result<bool, TypeMismatchError> {
        let command_type = command_type.into();
        let aggregate_type = self.registry.command_def(&command_type)?.aggregate.clone();

        // Queued builds only make sense for a concrete user.
        let overlay_user = if queue_events { user } else { None };
        let aggregate = self
            .factory
            .build(aggregate_uuid, &aggregate_type, None, overlay_user);

        let mut command = Command::new(
            command_type,
            aggregate_uuid,
            aggregate.meta().version,
            payload,
        );
        if let Some(user) = user {
            command = command.with_user(user);
        }
        Ok(self.dispatch(command, queue_events))
    }

    /// Run the pipeline for a prepared command.
    ///
    /// With `queue_events` the produced events land in the user's speculative
    /// queue instead of the canonical stream.
    pub fn dispatch(&self, command: Command, queue_events: bool) -> bool {
        tracing::debug!(
            command_type = %command.command_type(),
            aggregate_uuid = %command.aggregate_uuid(),
            queue_events,
            "dispatching command",
        );

        let (def, handler) = match self.resolve_command(&command) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.message_bus.dispatch(
                    Message::new(e.to_string(), e.status_code())
                        .for_command(command.uuid())
                        .for_aggregate(command.aggregate_uuid())
                        .with_error(e.into()),
                );
                return self.verdict(command.uuid());
            }
        };

        let mut events = Vec::new();
        for mut aggregate in self.handle_command(&command, def, handler.as_ref(), queue_events) {
            events.extend(aggregate.meta_mut().take_pending());
        }
        self.event_bus
            .publish(events, queue_events, self, Some(&command));

        self.verdict(command.uuid())
    }

    fn resolve_command(
        &self,
        command: &Command,
    ) -> Result<(CommandDef, Arc<dyn Handler>), TypeMismatchError> {
        let def = self.registry.command_def(command.command_type())?.clone();
        let handler = self.registry.resolve_handler(&def.handler)?;
        Ok((def, handler))
    }

    /// Validate and gate the command, minting its event on success.
    ///
    /// Returns the touched aggregates with the minted events pending; empty
    /// when the command was rejected.
    fn handle_command(
        &self,
        command: &Command,
        def: CommandDef,
        handler: &dyn Handler,
        queue_events: bool,
    ) -> Vec<Box<dyn Aggregate>> {
        let overlay_user = if queue_events { command.user() } else { None };
        let mut aggregate =
            self.factory
                .build(command.aggregate_uuid(), &def.aggregate, None, overlay_user);

        let mut valid = true;
        if let Err(e) = handler.validate_command(command, aggregate.as_ref()) {
            self.message_bus.dispatch(
                Message::new(e.message.clone(), e.code)
                    .for_command(command.uuid())
                    .for_aggregate(command.aggregate_uuid())
                    .with_error(e.into()),
            );
            valid = false;
        }

        // The gate runs after validation so a stale, invalid command still
        // reports its validation failure first.
        if aggregate.meta().version != command.on_version() {
            self.message_bus.dispatch(
                Message::new(
                    "Aggregate target version is outdated or does not exist",
                    StatusCode::Conflict,
                )
                .for_command(command.uuid())
                .for_aggregate(command.aggregate_uuid()),
            );
            return Vec::new();
        }

        if !valid {
            self.message_bus.dispatch(
                Message::new("Invalid Command", StatusCode::BadRequest)
                    .for_command(command.uuid())
                    .for_aggregate(command.aggregate_uuid()),
            );
            return Vec::new();
        }

        let event = handler.create_event(command);
        // An event no registry entry can replay is refused outright.
        if let Err(e) = self.registry.event_def(&event.event_type) {
            self.message_bus.dispatch(
                Message::new(e.to_string(), e.status_code())
                    .for_command(command.uuid())
                    .for_aggregate(command.aggregate_uuid())
                    .with_error(e.into()),
            );
            return Vec::new();
        }
        self.factory.apply(aggregate.as_mut(), event);
        vec![aggregate]
    }

    /// First message correlated to the command decides; only a persisted
    /// (or queued) event reports success.
    fn verdict(&self, uuid: CommandId) -> bool {
        self.message_bus
            .messages_by_command(uuid)
            .first()
            .map_or(false, |m| m.code == StatusCode::Ok)
    }
}
