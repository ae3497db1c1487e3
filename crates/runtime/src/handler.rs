//! Handler contract: validate commands, mint events, apply them.

use cqrskit_core::{Aggregate, Event, ValidationError};

use crate::command::Command;

/// Per-command-type logic: validation, event creation and state transition.
///
/// `execute` doubles as the replay path: rebuilding an aggregate runs the
/// same handlers over historical events, so it must stay deterministic,
/// side-effect free, and tolerant of payloads it does not recognize.
pub trait Handler: Send + Sync {
    /// Check the command against the current aggregate state.
    fn validate_command(
        &self,
        command: &Command,
        aggregate: &dyn Aggregate,
    ) -> Result<(), ValidationError>;

    /// Mint the event recording this command, at `on_version + 1`.
    fn create_event(&self, command: &Command) -> Event;

    /// Apply the event to the aggregate, returning the updated aggregate.
    fn execute(&self, event: &Event, aggregate: Box<dyn Aggregate>) -> Box<dyn Aggregate>;
}
