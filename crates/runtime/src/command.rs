//! Commands: transient intent targeting one aggregate.

use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use cqrskit_core::{AggregateId, CommandId, Event, TypeTag, UserId};

use crate::command_bus::CommandBus;

/// Callback invoked with each event a command produced, after persistence.
pub type CommandCallback = Arc<dyn Fn(&CommandBus, &Event) -> anyhow::Result<()> + Send + Sync>;

/// Intent to change one aggregate, pinned to the version it was decided on.
///
/// Commands are never persisted; only the events they produce are.
/// `on_version` is the optimistic concurrency anchor: a command decided
/// against version N mints its event at version N + 1, and dispatch rejects
/// the command when the aggregate has moved past N in the meantime.
#[derive(Clone)]
pub struct Command {
    command_type: TypeTag,
    uuid: CommandId,
    aggregate_uuid: AggregateId,
    on_version: u64,
    user: Option<UserId>,
    payload: JsonValue,
    listener: Option<CommandCallback>,
}

impl Command {
    pub fn new(
        command_type: impl Into<TypeTag>,
        aggregate_uuid: AggregateId,
        on_version: u64,
        payload: JsonValue,
    ) -> Self {
        Self {
            command_type: command_type.into(),
            uuid: CommandId::new(),
            aggregate_uuid,
            on_version,
            user: None,
            payload,
            listener: None,
        }
    }

    /// Pin the command identifier instead of generating one.
    pub fn with_uuid(mut self, uuid: CommandId) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn with_user(mut self, user: UserId) -> Self {
        self.user = Some(user);
        self
    }

    /// Attach a callback run once per produced event after persistence.
    pub fn with_listener(mut self, listener: CommandCallback) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn command_type(&self) -> &TypeTag {
        &self.command_type
    }

    pub fn uuid(&self) -> CommandId {
        self.uuid
    }

    pub fn aggregate_uuid(&self) -> AggregateId {
        self.aggregate_uuid
    }

    pub fn on_version(&self) -> u64 {
        self.on_version
    }

    pub fn user(&self) -> Option<UserId> {
        self.user
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn listener(&self) -> Option<&CommandCallback> {
        self.listener.as_ref()
    }

    /// Build the event recording this command, one version past its anchor.
    ///
    /// The payload travels along unchanged; handlers needing a different
    /// event payload construct the [`Event`] themselves.
    pub fn event(
        &self,
        event_type: impl Into<TypeTag>,
        aggregate_type: impl Into<TypeTag>,
        message: impl Into<String>,
    ) -> Event {
        Event {
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_uuid: self.aggregate_uuid,
            command_uuid: self.uuid,
            version: self.on_version + 1,
            user: self.user,
            payload: self.payload.clone(),
            message: message.into(),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("command_type", &self.command_type)
            .field("uuid", &self.uuid)
            .field("aggregate_uuid", &self.aggregate_uuid)
            .field("on_version", &self.on_version)
            .field("user", &self.user)
            .field("payload", &self.payload)
            .field("listener", &self.listener.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_lands_one_version_past_the_anchor() {
        let aggregate = AggregateId::new();
        let user = UserId::new();
        let command = Command::new("page.create", aggregate, 3, json!({ "title": "Home" }))
            .with_user(user);

        let event = command.event("page.created", "page", "Page Created");
        assert_eq!(event.version, 4);
        assert_eq!(event.aggregate_uuid, aggregate);
        assert_eq!(event.command_uuid, command.uuid());
        assert_eq!(event.user, Some(user));
        assert_eq!(event.payload, json!({ "title": "Home" }));
        assert_eq!(event.message, "Page Created");
    }

    #[test]
    fn debug_output_hides_the_callback_body() {
        let command = Command::new("page.create", AggregateId::new(), 0, json!({}))
            .with_listener(Arc::new(|_, _| Ok(())));
        let rendered = format!("{command:?}");
        assert!(rendered.contains("<callback>"));
    }
}
