use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use cqrskit_core::{
    Aggregate, AggregateId, AggregateMeta, Event, StatusCode, TypeTag, ValidationError,
};
use cqrskit_runtime::{Command, CommandBus, Handler, Listener, RegistryBuilder};

/// Aggregate type tag, as registered and persisted on every row.
pub const PAGE: &str = "page";
pub const PAGE_CREATE: &str = "page.create";
pub const PAGE_CREATED: &str = "page.created";
pub const PAGE_RENAME: &str = "page.rename";
pub const PAGE_RENAMED: &str = "page.renamed";

const PAGE_CREATE_HANDLER: &str = "page.create.handler";
const PAGE_RENAME_HANDLER: &str = "page.rename.handler";
const PAGE_ACTIVITY_LISTENER: &str = "page.activity.listener";

/// Domain state of a page, serialized as-is into snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageState {
    pub title: Option<String>,
}

/// Aggregate root: Page.
pub struct Page {
    meta: AggregateMeta,
    state: PageState,
}

impl Page {
    /// Empty, not-yet-created instance for rehydration.
    pub fn new(uuid: AggregateId) -> Self {
        Self {
            meta: AggregateMeta::new(uuid),
            state: PageState::default(),
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.state.title.as_deref()
    }
}

impl Aggregate for Page {
    fn aggregate_type(&self) -> TypeTag {
        TypeTag::from(PAGE)
    }

    fn meta(&self) -> &AggregateMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut AggregateMeta {
        &mut self.meta
    }

    fn snapshot_state(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(&self.state)
    }

    fn restore_snapshot(&mut self, state: JsonValue) -> Result<(), serde_json::Error> {
        self.state = serde_json::from_value(state)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn title_of(payload: &JsonValue) -> &str {
    payload
        .get("title")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .unwrap_or("")
}

fn set_title(aggregate: &mut dyn Aggregate, payload: &JsonValue) {
    if let Some(page) = aggregate.as_any_mut().downcast_mut::<Page>() {
        page.state.title = Some(title_of(payload).to_string());
    }
}

/// Handler for `page.create`.
pub struct PageCreateHandler;

impl Handler for PageCreateHandler {
    fn validate_command(
        &self,
        command: &Command,
        aggregate: &dyn Aggregate,
    ) -> Result<(), ValidationError> {
        if aggregate.meta().version != 0 {
            return Err(ValidationError::new(
                "Page already exists",
                StatusCode::Conflict,
            ));
        }
        if title_of(command.payload()).is_empty() {
            return Err(ValidationError::bad_request("You must enter a title"));
        }
        Ok(())
    }

    fn create_event(&self, command: &Command) -> Event {
        command.event(PAGE_CREATED, PAGE, "Page Created")
    }

    fn execute(&self, event: &Event, mut aggregate: Box<dyn Aggregate>) -> Box<dyn Aggregate> {
        set_title(aggregate.as_mut(), &event.payload);
        aggregate
    }
}

/// Handler for `page.rename`.
pub struct PageRenameHandler;

impl Handler for PageRenameHandler {
    fn validate_command(
        &self,
        command: &Command,
        aggregate: &dyn Aggregate,
    ) -> Result<(), ValidationError> {
        if aggregate.meta().version == 0 {
            return Err(ValidationError::new(
                "Page does not exist",
                StatusCode::Conflict,
            ));
        }
        if title_of(command.payload()).is_empty() {
            return Err(ValidationError::bad_request("You must enter a title"));
        }
        Ok(())
    }

    fn create_event(&self, command: &Command) -> Event {
        command.event(PAGE_RENAMED, PAGE, "Page Renamed")
    }

    fn execute(&self, event: &Event, mut aggregate: Box<dyn Aggregate>) -> Box<dyn Aggregate> {
        set_title(aggregate.as_mut(), &event.payload);
        aggregate
    }
}

/// Publication-time audit trail for page events.
pub struct PageActivityListener;

impl Listener for PageActivityListener {
    fn handle(&self, _command_bus: &CommandBus, event: &Event) -> anyhow::Result<()> {
        tracing::info!(
            aggregate_uuid = %event.aggregate_uuid,
            version = event.version,
            event_type = %event.event_type,
            title = title_of(&event.payload),
            "page activity",
        );
        Ok(())
    }
}

/// Wire the page domain into a registry.
pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .aggregate(PAGE, |uuid| Box::new(Page::new(uuid)))
        .handler(PAGE_CREATE_HANDLER, Arc::new(PageCreateHandler))
        .handler(PAGE_RENAME_HANDLER, Arc::new(PageRenameHandler))
        .listener(PAGE_ACTIVITY_LISTENER, Arc::new(PageActivityListener))
        .command(PAGE_CREATE, PAGE_CREATE_HANDLER, PAGE)
        .command(PAGE_RENAME, PAGE_RENAME_HANDLER, PAGE)
        .event(
            PAGE_CREATED,
            PAGE_CREATE_HANDLER,
            Some(TypeTag::from(PAGE_ACTIVITY_LISTENER)),
        )
        .event(
            PAGE_RENAMED,
            PAGE_RENAME_HANDLER,
            Some(TypeTag::from(PAGE_ACTIVITY_LISTENER)),
        )
}
