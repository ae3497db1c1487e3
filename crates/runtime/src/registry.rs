//! Startup-built registry mapping type tags to domain wiring.

use std::collections::HashMap;
use std::sync::Arc;

use cqrskit_core::{Aggregate, AggregateId, ContractKind, TypeMismatchError, TypeTag};

use crate::handler::Handler;
use crate::listener::Listener;

/// Constructor for a fresh, empty aggregate of one type.
pub type AggregateCtor = Box<dyn Fn(AggregateId) -> Box<dyn Aggregate> + Send + Sync>;

/// How a handler or listener is resolved: one shared instance, or a factory
/// minting a fresh instance per resolution.
enum Provider<T: ?Sized> {
    Singleton(Arc<T>),
    Factory(Box<dyn Fn() -> Arc<T> + Send + Sync>),
}

impl<T: ?Sized> Provider<T> {
    fn resolve(&self) -> Arc<T> {
        match self {
            Provider::Singleton(instance) => Arc::clone(instance),
            Provider::Factory(factory) => factory(),
        }
    }
}

/// Wiring of one command type: who handles it, which aggregate it targets.
#[derive(Debug, Clone)]
pub struct CommandDef {
    pub handler: TypeTag,
    pub aggregate: TypeTag,
}

/// Wiring of one event type: who applies it during replay, who (optionally)
/// reacts to it at publication.
#[derive(Debug, Clone)]
pub struct EventDef {
    pub handler: TypeTag,
    pub listener: Option<TypeTag>,
}

/// Immutable lookup tables built once at startup.
///
/// Every dynamic resolution in the runtime goes through here; an unknown tag
/// comes back as a [`TypeMismatchError`] instead of a crash, and the caller
/// turns it into a message.
pub struct Registry {
    aggregates: HashMap<TypeTag, AggregateCtor>,
    handlers: HashMap<TypeTag, Provider<dyn Handler>>,
    listeners: HashMap<TypeTag, Provider<dyn Listener>>,
    commands: HashMap<TypeTag, CommandDef>,
    events: HashMap<TypeTag, EventDef>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn new_aggregate(
        &self,
        tag: &TypeTag,
        uuid: AggregateId,
    ) -> Result<Box<dyn Aggregate>, TypeMismatchError> {
        self.aggregates
            .get(tag)
            .map(|ctor| ctor(uuid))
            .ok_or_else(|| TypeMismatchError::new(ContractKind::Aggregate, tag))
    }

    pub fn resolve_handler(&self, tag: &TypeTag) -> Result<Arc<dyn Handler>, TypeMismatchError> {
        self.handlers
            .get(tag)
            .map(Provider::resolve)
            .ok_or_else(|| TypeMismatchError::new(ContractKind::Handler, tag))
    }

    pub fn resolve_listener(&self, tag: &TypeTag) -> Result<Arc<dyn Listener>, TypeMismatchError> {
        self.listeners
            .get(tag)
            .map(Provider::resolve)
            .ok_or_else(|| TypeMismatchError::new(ContractKind::Listener, tag))
    }

    pub fn command_def(&self, tag: &TypeTag) -> Result<&CommandDef, TypeMismatchError> {
        self.commands
            .get(tag)
            .ok_or_else(|| TypeMismatchError::new(ContractKind::Command, tag))
    }

    pub fn event_def(&self, tag: &TypeTag) -> Result<&EventDef, TypeMismatchError> {
        self.events
            .get(tag)
            .ok_or_else(|| TypeMismatchError::new(ContractKind::Event, tag))
    }

    /// Resolve the handler that replays events of this type.
    ///
    /// Fails on either an unregistered event tag or an unresolvable handler
    /// tag; the error names whichever contract was missing.
    pub fn replay_handler(
        &self,
        event_type: &TypeTag,
    ) -> Result<Arc<dyn Handler>, TypeMismatchError> {
        let def = self.event_def(event_type)?;
        self.resolve_handler(&def.handler)
    }
}

/// Collects registrations before freezing them into a [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    aggregates: HashMap<TypeTag, AggregateCtor>,
    handlers: HashMap<TypeTag, Provider<dyn Handler>>,
    listeners: HashMap<TypeTag, Provider<dyn Listener>>,
    commands: HashMap<TypeTag, CommandDef>,
    events: HashMap<TypeTag, EventDef>,
}

impl RegistryBuilder {
    pub fn aggregate(
        mut self,
        tag: impl Into<TypeTag>,
        ctor: impl Fn(AggregateId) -> Box<dyn Aggregate> + Send + Sync + 'static,
    ) -> Self {
        self.aggregates.insert(tag.into(), Box::new(ctor));
        self
    }

    /// Register one shared handler instance.
    pub fn handler(mut self, tag: impl Into<TypeTag>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(tag.into(), Provider::Singleton(handler));
        self
    }

    /// Register a handler factory minting a fresh instance per resolution.
    pub fn handler_fn(
        mut self,
        tag: impl Into<TypeTag>,
        factory: impl Fn() -> Arc<dyn Handler> + Send + Sync + 'static,
    ) -> Self {
        self.handlers
            .insert(tag.into(), Provider::Factory(Box::new(factory)));
        self
    }

    /// Register one shared listener instance.
    pub fn listener(mut self, tag: impl Into<TypeTag>, listener: Arc<dyn Listener>) -> Self {
        self.listeners
            .insert(tag.into(), Provider::Singleton(listener));
        self
    }

    /// Register a listener factory minting a fresh instance per resolution.
    pub fn listener_fn(
        mut self,
        tag: impl Into<TypeTag>,
        factory: impl Fn() -> Arc<dyn Listener> + Send + Sync + 'static,
    ) -> Self {
        self.listeners
            .insert(tag.into(), Provider::Factory(Box::new(factory)));
        self
    }

    pub fn command(
        mut self,
        tag: impl Into<TypeTag>,
        handler: impl Into<TypeTag>,
        aggregate: impl Into<TypeTag>,
    ) -> Self {
        self.commands.insert(
            tag.into(),
            CommandDef {
                handler: handler.into(),
                aggregate: aggregate.into(),
            },
        );
        self
    }

    pub fn event(
        mut self,
        tag: impl Into<TypeTag>,
        handler: impl Into<TypeTag>,
        listener: Option<TypeTag>,
    ) -> Self {
        self.events.insert(
            tag.into(),
            EventDef {
                handler: handler.into(),
                listener,
            },
        );
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            aggregates: self.aggregates,
            handlers: self.handlers,
            listeners: self.listeners,
            commands: self.commands,
            events: self.events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqrskit_core::{Event, GenericAggregate, ValidationError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopHandler;

    impl Handler for NoopHandler {
        fn validate_command(
            &self,
            _command: &crate::command::Command,
            _aggregate: &dyn Aggregate,
        ) -> Result<(), ValidationError> {
            Ok(())
        }

        fn create_event(&self, command: &crate::command::Command) -> Event {
            command.event("noop", "noop", "Noop")
        }

        fn execute(&self, _event: &Event, aggregate: Box<dyn Aggregate>) -> Box<dyn Aggregate> {
            aggregate
        }
    }

    #[test]
    fn unknown_tags_name_the_missing_contract() {
        let registry = Registry::builder().build();
        let tag = TypeTag::from("page.create");

        let err = registry.command_def(&tag).unwrap_err();
        assert_eq!(err.kind, ContractKind::Command);

        let err = registry.resolve_handler(&tag).err().unwrap();
        assert_eq!(err.kind, ContractKind::Handler);

        let err = registry.new_aggregate(&tag, AggregateId::new()).err().unwrap();
        assert_eq!(err.kind, ContractKind::Aggregate);
    }

    #[test]
    fn factories_mint_per_resolution_while_singletons_share() {
        let minted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&minted);
        let registry = Registry::builder()
            .handler("shared", Arc::new(NoopHandler))
            .handler_fn("fresh", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Arc::new(NoopHandler)
            })
            .build();

        let shared = TypeTag::from("shared");
        let fresh = TypeTag::from("fresh");

        registry.resolve_handler(&shared).unwrap();
        registry.resolve_handler(&shared).unwrap();
        assert_eq!(minted.load(Ordering::SeqCst), 0);

        registry.resolve_handler(&fresh).unwrap();
        registry.resolve_handler(&fresh).unwrap();
        assert_eq!(minted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn aggregate_ctor_receives_the_uuid() {
        let registry = Registry::builder()
            .aggregate("generic", |uuid| Box::new(GenericAggregate::new(uuid)))
            .build();

        let uuid = AggregateId::new();
        let aggregate = registry
            .new_aggregate(&TypeTag::from("generic"), uuid)
            .unwrap();
        assert_eq!(aggregate.meta().uuid, uuid);
    }
}
