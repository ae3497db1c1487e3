//! Per-cycle diagnostic messages and the bus collecting them.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;

use crate::id::{AggregateId, CommandId};
use crate::status::StatusCode;

/// Ephemeral record of one outcome inside a command cycle.
///
/// Correlation is optional on purpose: store-level failures during queue
/// promotion have no originating command to point at.
#[derive(Debug, Clone)]
pub struct Message {
    pub message: String,
    pub code: StatusCode,
    pub command_uuid: Option<CommandId>,
    pub aggregate_uuid: Option<AggregateId>,
    pub created: DateTime<Utc>,
    pub error: Option<Arc<anyhow::Error>>,
    pub context: Option<JsonValue>,
}

impl Message {
    pub fn new(message: impl Into<String>, code: StatusCode) -> Self {
        Self {
            message: message.into(),
            code,
            command_uuid: None,
            aggregate_uuid: None,
            created: Utc::now(),
            error: None,
            context: None,
        }
    }

    pub fn for_command(mut self, uuid: CommandId) -> Self {
        self.command_uuid = Some(uuid);
        self
    }

    pub fn for_aggregate(mut self, uuid: AggregateId) -> Self {
        self.aggregate_uuid = Some(uuid);
        self
    }

    pub fn with_error(mut self, error: anyhow::Error) -> Self {
        self.error = Some(Arc::new(error));
        self
    }

    pub fn with_context(mut self, context: JsonValue) -> Self {
        self.context = Some(context);
        self
    }

    fn to_json(&self) -> JsonValue {
        json!({
            "message": self.message,
            "code": self.code.as_u16(),
            "command_uuid": self.command_uuid.map(|u| u.to_string()),
            "aggregate_uuid": self.aggregate_uuid.map(|u| u.to_string()),
            "created": self.created.to_rfc3339(),
            "error": self.error.as_ref().map(|e| format!("{e:#}")),
            "context": self.context,
        })
    }
}

/// Error re-raised out of [`MessageBus::messages_json`] in debug mode.
#[derive(Debug, Error, Clone)]
#[error("{inner}")]
pub struct RaisedError {
    inner: Arc<anyhow::Error>,
}

impl RaisedError {
    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }
}

/// In-process collector for the messages of one unit of work.
///
/// Scoped per dispatch cycle: hosts running dispatches concurrently give each
/// its own bus. Every dispatched message also emits a debug-level log line.
#[derive(Debug)]
pub struct MessageBus {
    debug: bool,
    messages: Mutex<Vec<Message>>,
}

impl MessageBus {
    pub fn new(debug: bool) -> Self {
        Self {
            debug,
            messages: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Message>> {
        // Message collection must survive a panicking sibling thread.
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn dispatch(&self, message: Message) {
        tracing::debug!(
            code = %message.code,
            command_uuid = ?message.command_uuid,
            aggregate_uuid = ?message.aggregate_uuid,
            "{}",
            message.message,
        );
        self.lock().push(message);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// All messages in dispatch order.
    pub fn messages(&self) -> Vec<Message> {
        self.lock().clone()
    }

    pub fn messages_by_command(&self, uuid: CommandId) -> Vec<Message> {
        self.lock()
            .iter()
            .filter(|m| m.command_uuid == Some(uuid))
            .cloned()
            .collect()
    }

    pub fn messages_by_aggregate(&self, uuid: AggregateId) -> Vec<Message> {
        self.lock()
            .iter()
            .filter(|m| m.aggregate_uuid == Some(uuid))
            .cloned()
            .collect()
    }

    /// Render all messages as JSON rows.
    ///
    /// In debug mode the first message carrying an attached error is
    /// re-raised instead, so development setups fail loudly while production
    /// keeps serving diagnostics.
    pub fn messages_json(&self) -> Result<JsonValue, RaisedError> {
        let messages = self.lock();
        let mut rows = Vec::with_capacity(messages.len());
        for message in messages.iter() {
            if self.debug {
                if let Some(error) = &message.error {
                    return Err(RaisedError {
                        inner: Arc::clone(error),
                    });
                }
            }
            rows.push(message.to_json());
        }
        Ok(JsonValue::Array(rows))
    }
}
