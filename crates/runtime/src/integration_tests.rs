//! Integration tests for the full dispatch pipeline.
//!
//! Exercises: Command → CommandBus → Handler → EventStore → Messages → Verdict
//!
//! Verifies:
//! - Accepted commands persist events and report truthful verdicts
//! - Optimistic concurrency rejects stale anchors and racing writers
//! - Queued events stay speculative until promoted, scoped to their user

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex};

    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use serde_json::{Value as JsonValue, json};

    use cqrskit_core::{
        Aggregate, AggregateId, AggregateMeta, CommandId, ContractKind, Event, MessageBus,
        StatusCode, TypeTag, UserId, ValidationError,
    };
    use cqrskit_store::{EventStore, InMemoryEventStore, InMemorySnapshotStore, StreamEvent};

    use crate::command::Command;
    use crate::command_bus::CommandBus;
    use crate::handler::Handler;
    use crate::listener::Listener;
    use crate::registry::Registry;

    const NOTE: &str = "note";
    const NOTE_CREATE: &str = "note.create";
    const NOTE_CREATED: &str = "note.created";
    const NOTE_APPEND: &str = "note.append";
    const NOTE_APPENDED: &str = "note.appended";
    const NOTE_CREATE_HANDLER: &str = "note.create.handler";
    const NOTE_APPEND_HANDLER: &str = "note.append.handler";
    const NOTE_CREATED_LISTENER: &str = "note.created.listener";

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct NoteState {
        body: String,
    }

    struct Note {
        meta: AggregateMeta,
        state: NoteState,
    }

    impl Note {
        fn new(uuid: AggregateId) -> Self {
            Self {
                meta: AggregateMeta::new(uuid),
                state: NoteState::default(),
            }
        }
    }

    impl Aggregate for Note {
        fn aggregate_type(&self) -> TypeTag {
            TypeTag::from(NOTE)
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

    fn body_of(payload: &JsonValue) -> &str {
        payload.get("body").and_then(JsonValue::as_str).unwrap_or("")
    }

    struct NoteCreateHandler;

    impl Handler for NoteCreateHandler {
        fn validate_command(
            &self,
            command: &Command,
            aggregate: &dyn Aggregate,
        ) -> Result<(), ValidationError> {
            if aggregate.meta().version != 0 {
                return Err(ValidationError::new(
                    "Note already exists",
                    StatusCode::Conflict,
                ));
            }
            if body_of(command.payload()).is_empty() {
                return Err(ValidationError::bad_request("You must enter a body"));
            }
            Ok(())
        }

        fn create_event(&self, command: &Command) -> Event {
            command.event(NOTE_CREATED, NOTE, "Note Created")
        }

        fn execute(&self, event: &Event, mut aggregate: Box<dyn Aggregate>) -> Box<dyn Aggregate> {
            if let Some(note) = aggregate.as_any_mut().downcast_mut::<Note>() {
                note.state.body = body_of(&event.payload).to_string();
            }
            aggregate
        }
    }

    struct NoteAppendHandler;

    impl Handler for NoteAppendHandler {
        fn validate_command(
            &self,
            command: &Command,
            aggregate: &dyn Aggregate,
        ) -> Result<(), ValidationError> {
            if aggregate.meta().version == 0 {
                return Err(ValidationError::new(
                    "Note does not exist",
                    StatusCode::Conflict,
                ));
            }
            if body_of(command.payload()).is_empty() {
                return Err(ValidationError::bad_request("You must enter a body"));
            }
            Ok(())
        }

        fn create_event(&self, command: &Command) -> Event {
            command.event(NOTE_APPENDED, NOTE, "Note Appended")
        }

        fn execute(&self, event: &Event, mut aggregate: Box<dyn Aggregate>) -> Box<dyn Aggregate> {
            if let Some(note) = aggregate.as_any_mut().downcast_mut::<Note>() {
                note.state.body.push_str(body_of(&event.payload));
            }
            aggregate
        }
    }

    struct CountingListener {
        hits: Arc<AtomicUsize>,
    }

    impl Listener for CountingListener {
        fn handle(&self, _bus: &CommandBus, _event: &Event) -> anyhow::Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingListener;

    impl Listener for FailingListener {
        fn handle(&self, _bus: &CommandBus, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("listener exploded")
        }
    }

    fn registry(hits: Arc<AtomicUsize>) -> Arc<Registry> {
        Arc::new(
            Registry::builder()
                .aggregate(NOTE, |uuid| Box::new(Note::new(uuid)))
                .handler(NOTE_CREATE_HANDLER, Arc::new(NoteCreateHandler))
                .handler(NOTE_APPEND_HANDLER, Arc::new(NoteAppendHandler))
                .listener(NOTE_CREATED_LISTENER, Arc::new(CountingListener { hits }))
                .command(NOTE_CREATE, NOTE_CREATE_HANDLER, NOTE)
                .command(NOTE_APPEND, NOTE_APPEND_HANDLER, NOTE)
                .event(
                    NOTE_CREATED,
                    NOTE_CREATE_HANDLER,
                    Some(TypeTag::from(NOTE_CREATED_LISTENER)),
                )
                .event(NOTE_APPENDED, NOTE_APPEND_HANDLER, None)
                .build(),
        )
    }

    fn runtime_with(
        store: Arc<InMemoryEventStore>,
        hits: Arc<AtomicUsize>,
    ) -> (CommandBus, Arc<MessageBus>) {
        let messages = Arc::new(MessageBus::new(false));
        let snapshots = Arc::new(InMemorySnapshotStore::new(Arc::clone(&messages)));
        let bus = CommandBus::new(registry(hits), store, snapshots, Arc::clone(&messages));
        (bus, messages)
    }

    fn runtime() -> (
        CommandBus,
        Arc<MessageBus>,
        Arc<InMemoryEventStore>,
        Arc<AtomicUsize>,
    ) {
        let store = Arc::new(InMemoryEventStore::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let (bus, messages) = runtime_with(Arc::clone(&store), Arc::clone(&hits));
        (bus, messages, store, hits)
    }

    #[test]
    fn accepted_command_persists_and_reports_ok() {
        let (bus, messages, store, _) = runtime();
        let uuid = AggregateId::new();

        let accepted = bus
            .execute(NOTE_CREATE, uuid, json!({ "body": "first line" }), None, false)
            .unwrap();

        assert!(accepted);
        let rows = store.find(uuid, None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version, 1);
        assert_eq!(rows[0].event_type, TypeTag::from(NOTE_CREATED));

        let for_command = messages.messages_by_command(rows[0].command_uuid);
        assert_eq!(for_command.len(), 1);
        assert_eq!(for_command[0].code, StatusCode::Ok);
        assert_eq!(for_command[0].message, "Persisted event: Note Created");

        let note = bus.factory().build(uuid, &TypeTag::from(NOTE), None, None);
        assert_eq!(note.meta().version, 1);
        assert_eq!(note.meta().stream_version, 1);
        let note = note.as_any().downcast_ref::<Note>().unwrap();
        assert_eq!(note.state.body, "first line");
    }

    #[test]
    fn stale_version_anchor_is_rejected() {
        let (bus, messages, store, _) = runtime();
        let uuid = AggregateId::new();
        bus.execute(NOTE_CREATE, uuid, json!({ "body": "a" }), None, false)
            .unwrap();
        bus.execute(NOTE_APPEND, uuid, json!({ "body": "b" }), None, false)
            .unwrap();

        // Anchored at version 1, but the note has moved to 2.
        let command = Command::new(NOTE_APPEND, uuid, 1, json!({ "body": "c" }));
        let command_uuid = command.uuid();
        let accepted = bus.dispatch(command, false);

        assert!(!accepted);
        let for_command = messages.messages_by_command(command_uuid);
        assert_eq!(for_command.len(), 1);
        assert_eq!(for_command[0].code, StatusCode::Conflict);
        assert_eq!(
            for_command[0].message,
            "Aggregate target version is outdated or does not exist"
        );
        assert_eq!(store.find(uuid, None, None).unwrap().len(), 2);
    }

    #[test]
    fn invalid_command_persists_nothing() {
        let (bus, messages, store, _) = runtime();
        let uuid = AggregateId::new();

        let accepted = bus
            .execute(NOTE_CREATE, uuid, json!({ "body": "" }), None, false)
            .unwrap();

        assert!(!accepted);
        let all = messages.messages();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message, "You must enter a body");
        assert_eq!(all[0].code, StatusCode::BadRequest);
        assert_eq!(all[1].message, "Invalid Command");
        assert_eq!(all[1].code, StatusCode::BadRequest);
        assert!(store.find(uuid, None, None).unwrap().is_empty());
    }

    #[test]
    fn stale_and_invalid_command_reports_validation_first() {
        let (bus, messages, _store, _) = runtime();
        let uuid = AggregateId::new();
        bus.execute(NOTE_CREATE, uuid, json!({ "body": "a" }), None, false)
            .unwrap();

        // Anchored before the create, with an empty body on top.
        let command = Command::new(NOTE_APPEND, uuid, 0, json!({ "body": "" }));
        let command_uuid = command.uuid();
        let accepted = bus.dispatch(command, false);

        assert!(!accepted);
        let for_command = messages.messages_by_command(command_uuid);
        assert_eq!(for_command.len(), 2);
        assert_eq!(for_command[0].code, StatusCode::BadRequest);
        assert_eq!(for_command[0].message, "You must enter a body");
        assert_eq!(for_command[1].code, StatusCode::Conflict);
    }

    #[test]
    fn queued_events_stay_out_of_the_canonical_stream() {
        let (bus, messages, store, hits) = runtime();
        let uuid = AggregateId::new();
        let user = UserId::new();

        let accepted = bus
            .execute(NOTE_CREATE, uuid, json!({ "body": "draft" }), Some(user), true)
            .unwrap();

        assert!(accepted);
        assert!(store.find(uuid, None, None).unwrap().is_empty());
        let queued = store.queued_objects(uuid, user).unwrap();
        assert_eq!(queued.len(), 1);

        let for_command = messages.messages_by_command(queued[0].stream().command_uuid);
        assert_eq!(for_command[0].code, StatusCode::Ok);
        assert_eq!(for_command[0].message, "Queued event: Note Created");

        // Listeners run at queue time, not at promotion.
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // For its author the draft is visible; canonically it is not.
        let theirs = bus
            .factory()
            .build(uuid, &TypeTag::from(NOTE), None, Some(user));
        assert_eq!(theirs.meta().version, 1);
        assert_eq!(theirs.meta().stream_version, 0);
        let theirs = theirs.as_any().downcast_ref::<Note>().unwrap();
        assert_eq!(theirs.state.body, "draft");

        let canonical = bus.factory().build(uuid, &TypeTag::from(NOTE), None, None);
        assert_eq!(canonical.meta().version, 0);
    }

    #[test]
    fn promotion_publishes_without_rerunning_listeners() {
        let (bus, _messages, store, hits) = runtime();
        let updates = bus.subscribe_updates();
        let uuid = AggregateId::new();
        let user = UserId::new();
        bus.execute(NOTE_CREATE, uuid, json!({ "body": "draft" }), Some(user), true)
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let queued = store.queued_objects(uuid, user).unwrap();
        let promoted = bus.event_bus().publish_queued(queued);

        assert!(promoted);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.find(uuid, None, None).unwrap().len(), 1);
        assert!(store.queued_objects(uuid, user).unwrap().is_empty());

        // Promotion is a canonical save, so subscribers hear about it.
        let update = updates.try_recv().unwrap();
        assert_eq!(update.event.aggregate_uuid, uuid);
        assert_eq!(update.event.version, 1);
    }

    #[test]
    fn stale_queue_fails_promotion_and_stays_queued() {
        let (bus, messages, store, _) = runtime();
        let uuid = AggregateId::new();
        let user = UserId::new();
        bus.execute(NOTE_CREATE, uuid, json!({ "body": "draft" }), Some(user), true)
            .unwrap();
        // Someone else creates the note canonically in the meantime.
        bus.execute(NOTE_CREATE, uuid, json!({ "body": "published" }), None, false)
            .unwrap();

        let queued = store.queued_objects(uuid, user).unwrap();
        let promoted = bus.event_bus().publish_queued(queued);

        assert!(!promoted);
        assert_eq!(store.queued_objects(uuid, user).unwrap().len(), 1);
        assert!(
            messages
                .messages()
                .iter()
                .any(|m| m.code == StatusCode::Conflict && m.command_uuid.is_none())
        );
    }

    #[test]
    fn queueing_without_a_user_is_rejected() {
        let (bus, messages, store, _) = runtime();
        let uuid = AggregateId::new();

        let accepted = bus
            .execute(NOTE_CREATE, uuid, json!({ "body": "draft" }), None, true)
            .unwrap();

        assert!(!accepted);
        assert!(
            messages
                .messages()
                .iter()
                .any(|m| m.message == "Cannot queue events without a user"
                    && m.code == StatusCode::Error)
        );

        // Nothing was staged: a later save commits nothing.
        store.save().unwrap();
        assert!(store.find(uuid, None, None).unwrap().is_empty());
    }

    #[test]
    fn discarded_queue_rows_vanish_from_the_users_view() {
        let (bus, _messages, store, _) = runtime();
        let uuid = AggregateId::new();
        let user = UserId::new();
        bus.execute(NOTE_CREATE, uuid, json!({ "body": "draft" }), Some(user), true)
            .unwrap();
        assert_eq!(store.queued_objects(uuid, user).unwrap().len(), 1);

        store.discard_queued(uuid, user).unwrap();

        assert!(store.queued_objects(uuid, user).unwrap().is_empty());
        let view = bus
            .factory()
            .build(uuid, &TypeTag::from(NOTE), None, Some(user));
        assert_eq!(view.meta().version, 0);
    }

    #[test]
    fn update_notifications_fire_only_for_canonical_saves() {
        let (bus, _messages, _store, _) = runtime();
        let updates = bus.subscribe_updates();
        let uuid = AggregateId::new();
        let user = UserId::new();

        bus.execute(NOTE_CREATE, uuid, json!({ "body": "draft" }), Some(user), true)
            .unwrap();
        assert!(updates.try_recv().is_err());

        let other = AggregateId::new();
        bus.execute(NOTE_CREATE, other, json!({ "body": "published" }), None, false)
            .unwrap();
        let update = updates.try_recv().unwrap();
        assert_eq!(update.event.aggregate_uuid, other);
        assert_eq!(update.event.version, 1);
    }

    #[test]
    fn racing_creates_one_wins_one_conflicts() {
        let shared = InMemoryEventStore::new();
        let uuid = AggregateId::new();
        let barrier = Arc::new(Barrier::new(2));

        let mut workers = Vec::new();
        for _ in 0..2 {
            let store = Arc::new(shared.handle());
            let barrier = Arc::clone(&barrier);
            workers.push(std::thread::spawn(move || {
                let hits = Arc::new(AtomicUsize::new(0));
                let (bus, messages) = runtime_with(store, hits);
                barrier.wait();
                let accepted = bus
                    .execute(NOTE_CREATE, uuid, json!({ "body": "mine" }), None, false)
                    .unwrap();
                (accepted, messages)
            }));
        }

        let outcomes: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|(accepted, _)| *accepted).count(), 1);

        let rows = shared.find(uuid, None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version, 1);

        let (_, loser_messages) = outcomes.iter().find(|(accepted, _)| !accepted).unwrap();
        assert_eq!(loser_messages.messages()[0].code, StatusCode::Conflict);
    }

    #[test]
    fn command_callbacks_run_after_persistence() {
        let (bus, _messages, _store, _) = runtime();
        let uuid = AggregateId::new();
        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let command = Command::new(NOTE_CREATE, uuid, 0, json!({ "body": "first" }))
            .with_listener(Arc::new(move |_bus, event| {
                sink.lock().unwrap().push(event.version);
                Ok(())
            }));
        let accepted = bus.dispatch(command, false);

        assert!(accepted);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn failing_command_callback_is_isolated() {
        let (bus, messages, store, _) = runtime();
        let uuid = AggregateId::new();
        let command = Command::new(NOTE_CREATE, uuid, 0, json!({ "body": "first" }))
            .with_listener(Arc::new(|_bus, _event| anyhow::bail!("downstream refused")));
        let command_uuid = command.uuid();

        let accepted = bus.dispatch(command, false);

        assert!(accepted);
        assert_eq!(store.find(uuid, None, None).unwrap().len(), 1);
        let for_command = messages.messages_by_command(command_uuid);
        assert_eq!(for_command[0].code, StatusCode::Ok);
        assert!(
            for_command
                .iter()
                .any(|m| m.message.contains("command callback failed"))
        );
    }

    #[test]
    fn failing_listener_is_isolated_from_the_verdict() {
        let store = Arc::new(InMemoryEventStore::new());
        let messages = Arc::new(MessageBus::new(false));
        let snapshots = Arc::new(InMemorySnapshotStore::new(Arc::clone(&messages)));
        let registry = Arc::new(
            Registry::builder()
                .aggregate(NOTE, |uuid| Box::new(Note::new(uuid)))
                .handler(NOTE_CREATE_HANDLER, Arc::new(NoteCreateHandler))
                .listener(NOTE_CREATED_LISTENER, Arc::new(FailingListener))
                .command(NOTE_CREATE, NOTE_CREATE_HANDLER, NOTE)
                .event(
                    NOTE_CREATED,
                    NOTE_CREATE_HANDLER,
                    Some(TypeTag::from(NOTE_CREATED_LISTENER)),
                )
                .build(),
        );
        let bus = CommandBus::new(
            registry,
            Arc::clone(&store) as Arc<dyn EventStore>,
            snapshots,
            Arc::clone(&messages),
        );
        let uuid = AggregateId::new();

        let accepted = bus
            .execute(NOTE_CREATE, uuid, json!({ "body": "x" }), None, false)
            .unwrap();

        assert!(accepted);
        assert_eq!(store.find(uuid, None, None).unwrap().len(), 1);
        assert!(
            messages
                .messages()
                .iter()
                .any(|m| m.message.contains("listener failed") && m.code == StatusCode::Error)
        );
    }

    #[test]
    fn unknown_command_type_fails_fast() {
        let (bus, _messages, _store, _) = runtime();

        let err = bus
            .execute("note.vanish", AggregateId::new(), json!({}), None, false)
            .unwrap_err();

        assert_eq!(err.kind, ContractKind::Command);
    }

    #[test]
    fn unregistered_event_in_the_stream_stops_replay_and_blocks_writes() {
        let (bus, messages, store, _) = runtime();
        let uuid = AggregateId::new();
        bus.execute(NOTE_CREATE, uuid, json!({ "body": "a" }), None, false)
            .unwrap();

        // A row of a retired event type nothing can replay any more.
        store.add(StreamEvent {
            uuid,
            command_uuid: CommandId::new(),
            version: 2,
            created: Utc::now(),
            event_type: TypeTag::from("note.retired"),
            aggregate_type: TypeTag::from(NOTE),
            user: None,
            payload: json!({}),
            message: "Note Retired".into(),
        });
        store.save().unwrap();

        // Replay stops at version 1, so the append anchors there and its
        // save collides with the existing version 2 row.
        let command = Command::new(NOTE_APPEND, uuid, 1, json!({ "body": "b" }));
        let command_uuid = command.uuid();
        let accepted = bus.dispatch(command, false);

        assert!(!accepted);
        assert_eq!(store.find(uuid, None, None).unwrap().len(), 2);
        assert!(
            messages
                .messages_by_aggregate(uuid)
                .iter()
                .any(|m| m.code == StatusCode::Error)
        );
        let for_command = messages.messages_by_command(command_uuid);
        assert_eq!(for_command[0].code, StatusCode::Conflict);
    }

    #[test]
    fn find_aggregates_rebuilds_each_stream() {
        let (bus, _messages, _store, _) = runtime();
        let first = AggregateId::new();
        let second = AggregateId::new();
        bus.execute(NOTE_CREATE, first, json!({ "body": "a" }), None, false)
            .unwrap();
        bus.execute(NOTE_CREATE, second, json!({ "body": "b" }), None, false)
            .unwrap();
        bus.execute(NOTE_APPEND, second, json!({ "body": "c" }), None, false)
            .unwrap();

        let all = bus
            .factory()
            .find_aggregates(Some(&TypeTag::from(NOTE)))
            .unwrap();

        assert_eq!(all.len(), 2);
        let second_note = all.iter().find(|a| a.meta().uuid == second).unwrap();
        assert_eq!(second_note.meta().version, 2);
        let second_note = second_note.as_any().downcast_ref::<Note>().unwrap();
        assert_eq!(second_note.state.body, "bc");
    }
}
