//! Postgres-backed store implementations.
//!
//! Persistent counterparts of the in-memory stores: the same staging
//! contract, with each `save` committing its batch in one transaction and the
//! `(uuid, version)` primary key enforcing optimistic concurrency at the
//! database level.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Concurrent save took the `(uuid, version)` slot first |
//! | Database (other) | Any other | `Backend` | Constraint or data errors |
//! | PoolClosed | N/A | `Backend` | Connection pool was closed |
//! | Other | N/A | `Backend` | Network errors, connection failures, etc. |
//!
//! ## Thread Safety
//!
//! Both stores are `Send + Sync`. The pool handles connection management;
//! `handle()` shares the pool while giving each dispatch cycle a private
//! staging buffer, exactly like the in-memory store.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use cqrskit_core::{
    Aggregate, AggregateId, CommandId, HistoryEntry, Message, MessageBus, StatusCode, TypeTag,
    UserId,
};

use crate::error::StoreError;
use crate::event_store::{EventStore, StagedOp};
use crate::record::{QueuedEvent, Snapshot, StreamEvent};
use crate::snapshot_store::SnapshotStore;

/// Create the stream, queue and snapshot tables if they do not exist.
#[instrument(skip(pool), err)]
pub async fn setup_schema(pool: &PgPool) -> Result<(), StoreError> {
    for ddl in [STREAM_DDL, QUEUE_DDL, SNAPSHOT_DDL] {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("setup_schema", e))?;
    }
    Ok(())
}

const STREAM_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS event_stream (
    uuid UUID NOT NULL,
    version BIGINT NOT NULL,
    command_uuid UUID NOT NULL,
    user_id UUID,
    event_type TEXT NOT NULL,
    aggregate_type TEXT NOT NULL,
    payload JSONB NOT NULL,
    message TEXT NOT NULL,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (uuid, version)
)
"#;

const QUEUE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS event_queue (
    uuid UUID NOT NULL,
    version BIGINT NOT NULL,
    command_uuid UUID NOT NULL,
    user_id UUID NOT NULL,
    event_type TEXT NOT NULL,
    aggregate_type TEXT NOT NULL,
    payload JSONB NOT NULL,
    message TEXT NOT NULL,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (version, uuid, user_id)
)
"#;

const SNAPSHOT_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    uuid UUID NOT NULL,
    version BIGINT NOT NULL,
    aggregate_type TEXT NOT NULL,
    state JSONB NOT NULL,
    history JSONB NOT NULL,
    aggregate_created TIMESTAMPTZ,
    aggregate_modified TIMESTAMPTZ,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (version, uuid)
)
"#;

/// Postgres-backed event store.
///
/// The synchronous [`EventStore`] trait is bridged onto the async pool with
/// `tokio::runtime::Handle`, so calls must originate from within a tokio
/// runtime context.
#[derive(Debug)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    staged: Mutex<Vec<StagedOp>>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            staged: Mutex::new(Vec::new()),
        }
    }

    /// A new handle over the same pool with its own staging buffer.
    pub fn handle(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            staged: Mutex::new(Vec::new()),
        }
    }

    fn stage(&self, op: StagedOp) {
        self.staged
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(op);
    }

    /// Canonical rows of one stream within the inclusive version bounds.
    #[instrument(skip(self), fields(uuid = %uuid.as_uuid()), err)]
    pub async fn find_stream(
        &self,
        uuid: AggregateId,
        max_version: Option<u64>,
        min_version: Option<u64>,
    ) -> Result<Vec<StreamEvent>, StoreError> {
        let span = Span::current();
        span.record("operation", "find_stream");

        let rows = sqlx::query(
            r#"
            SELECT
                uuid,
                version,
                command_uuid,
                user_id,
                event_type,
                aggregate_type,
                payload,
                message,
                created
            FROM event_stream
            WHERE uuid = $1
                AND ($2::bigint IS NULL OR version <= $2)
                AND ($3::bigint IS NULL OR version >= $3)
            ORDER BY version ASC
            "#,
        )
        .bind(uuid.as_uuid())
        .bind(max_version.map(|v| v as i64))
        .bind(min_version.map(|v| v as i64))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_stream", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let row = StreamEventRow::from_row(&row).map_err(|e| {
                StoreError::backend("find_stream", format!("failed to deserialize event row: {e}"))
            })?;
            events.push(row.into());
        }
        span.record("event_count", events.len());
        Ok(events)
    }

    /// Queued rows of one stream for one user within the inclusive bounds.
    #[instrument(
        skip(self),
        fields(uuid = %uuid.as_uuid(), user = %user.as_uuid()),
        err
    )]
    pub async fn find_queue(
        &self,
        uuid: AggregateId,
        user: UserId,
        max_version: Option<u64>,
        min_version: Option<u64>,
    ) -> Result<Vec<StreamEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                uuid,
                version,
                command_uuid,
                user_id,
                event_type,
                aggregate_type,
                payload,
                message,
                created
            FROM event_queue
            WHERE uuid = $1
                AND user_id = $2
                AND ($3::bigint IS NULL OR version <= $3)
                AND ($4::bigint IS NULL OR version >= $4)
            ORDER BY version ASC
            "#,
        )
        .bind(uuid.as_uuid())
        .bind(user.as_uuid())
        .bind(max_version.map(|v| v as i64))
        .bind(min_version.map(|v| v as i64))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_queue", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let row = StreamEventRow::from_row(&row).map_err(|e| {
                StoreError::backend("find_queue", format!("failed to deserialize queue row: {e}"))
            })?;
            events.push(row.into());
        }
        Ok(events)
    }

    async fn queued_rows(
        &self,
        uuid: AggregateId,
        user: UserId,
    ) -> Result<Vec<QueuedEvent>, StoreError> {
        let rows = self.find_queue(uuid, user, None, None).await?;
        rows.into_iter().map(QueuedEvent::new).collect()
    }

    /// First row (version 1) of every stream, optionally filtered by type.
    #[instrument(skip(self), err)]
    pub async fn first_rows(
        &self,
        aggregate_type: Option<&TypeTag>,
    ) -> Result<Vec<StreamEvent>, StoreError> {
        let tag: Option<&str> = aggregate_type.map(TypeTag::as_str);
        let rows = sqlx::query(
            r#"
            SELECT
                uuid,
                version,
                command_uuid,
                user_id,
                event_type,
                aggregate_type,
                payload,
                message,
                created
            FROM event_stream
            WHERE version = 1
                AND ($1::text IS NULL OR aggregate_type = $1)
            ORDER BY created ASC
            "#,
        )
        .bind(tag)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("first_rows", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let row = StreamEventRow::from_row(&row).map_err(|e| {
                StoreError::backend("first_rows", format!("failed to deserialize event row: {e}"))
            })?;
            events.push(row.into());
        }
        Ok(events)
    }

    /// Commit a staged batch in one transaction.
    ///
    /// Any failure rolls the transaction back, so no partial batch is ever
    /// applied.
    #[instrument(skip(self, batch), fields(op_count = batch.len()), err)]
    async fn commit(&self, batch: Vec<StagedOp>) -> Result<(), StoreError> {
        let span = Span::current();
        span.record("operation", "commit");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for op in &batch {
            match op {
                StagedOp::Append(event) => insert_stream_row(&mut tx, event).await?,
                StagedOp::Queue(queued) => insert_queue_row(&mut tx, queued).await?,
                StagedOp::Remove {
                    uuid,
                    user,
                    version,
                } => delete_queue_row(&mut tx, *uuid, *user, *version).await?,
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

impl EventStore for PostgresEventStore {
    fn find_aggregates(
        &self,
        aggregate_type: Option<&TypeTag>,
    ) -> Result<Vec<StreamEvent>, StoreError> {
        runtime_handle()?.block_on(self.first_rows(aggregate_type))
    }

    fn find(
        &self,
        uuid: AggregateId,
        max_version: Option<u64>,
        min_version: Option<u64>,
    ) -> Result<Vec<StreamEvent>, StoreError> {
        runtime_handle()?.block_on(self.find_stream(uuid, max_version, min_version))
    }

    fn find_queued(
        &self,
        uuid: AggregateId,
        user: UserId,
        max_version: Option<u64>,
        min_version: Option<u64>,
    ) -> Result<Vec<StreamEvent>, StoreError> {
        runtime_handle()?.block_on(self.find_queue(uuid, user, max_version, min_version))
    }

    fn queued_objects(
        &self,
        uuid: AggregateId,
        user: UserId,
    ) -> Result<Vec<QueuedEvent>, StoreError> {
        runtime_handle()?.block_on(self.queued_rows(uuid, user))
    }

    fn add(&self, event: StreamEvent) {
        self.stage(StagedOp::Append(event));
    }

    fn queue(&self, event: QueuedEvent) {
        self.stage(StagedOp::Queue(event));
    }

    fn remove(&self, event: QueuedEvent) {
        self.stage(StagedOp::Remove {
            uuid: event.stream().uuid,
            user: event.user(),
            version: event.stream().version,
        });
    }

    fn save(&self) -> Result<(), StoreError> {
        let batch: Vec<StagedOp> = {
            let mut staged = self
                .staged
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *staged)
        };
        if batch.is_empty() {
            return Ok(());
        }
        runtime_handle()?.block_on(self.commit(batch))
    }
}

/// Postgres-backed snapshot store.
#[derive(Debug)]
pub struct PostgresSnapshotStore {
    pool: Arc<PgPool>,
    message_bus: Arc<MessageBus>,
}

impl PostgresSnapshotStore {
    pub fn new(pool: PgPool, message_bus: Arc<MessageBus>) -> Self {
        Self {
            pool: Arc::new(pool),
            message_bus,
        }
    }

    /// Latest snapshot at or below `max_version`.
    #[instrument(skip(self), fields(uuid = %uuid.as_uuid()), err)]
    pub async fn find_snapshot(
        &self,
        uuid: AggregateId,
        max_version: Option<u64>,
    ) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                uuid,
                version,
                aggregate_type,
                state,
                history,
                aggregate_created,
                aggregate_modified,
                created
            FROM snapshots
            WHERE uuid = $1
                AND ($2::bigint IS NULL OR version <= $2)
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(uuid.as_uuid())
        .bind(max_version.map(|v| v as i64))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_snapshot", e))?;

        match row {
            Some(row) => {
                let row = SnapshotRow::from_row(&row).map_err(|e| {
                    StoreError::backend(
                        "find_snapshot",
                        format!("failed to deserialize snapshot row: {e}"),
                    )
                })?;
                Ok(Some(row.try_into()?))
            }
            None => Ok(None),
        }
    }

    #[instrument(
        skip(self, snapshot),
        fields(uuid = %snapshot.uuid.as_uuid(), version = snapshot.version),
        err
    )]
    async fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let history = serde_json::to_value(&snapshot.history)?;
        sqlx::query(
            r#"
            INSERT INTO snapshots (
                uuid,
                version,
                aggregate_type,
                state,
                history,
                aggregate_created,
                aggregate_modified,
                created
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(snapshot.uuid.as_uuid())
        .bind(snapshot.version as i64)
        .bind(snapshot.aggregate_type.as_str())
        .bind(&snapshot.state)
        .bind(history)
        .bind(snapshot.aggregate_created)
        .bind(snapshot.aggregate_modified)
        .bind(snapshot.created)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("store_snapshot", e))?;
        Ok(())
    }
}

impl SnapshotStore for PostgresSnapshotStore {
    fn find(
        &self,
        uuid: AggregateId,
        max_version: Option<u64>,
    ) -> Result<Option<Snapshot>, StoreError> {
        runtime_handle()?.block_on(self.find_snapshot(uuid, max_version))
    }

    fn save(&self, aggregate: &dyn Aggregate) {
        let uuid = aggregate.meta().uuid;
        let snapshot = match Snapshot::of(aggregate) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(uuid = %uuid, error = %e, "snapshot serialization failed");
                self.message_bus.dispatch(
                    Message::new(format!("snapshot serialization failed: {e}"), StatusCode::Error)
                        .for_aggregate(uuid)
                        .with_error(e.into()),
                );
                return;
            }
        };

        let result =
            runtime_handle().and_then(|handle| handle.block_on(self.store_snapshot(&snapshot)));
        if let Err(e) = result {
            let code = e.status_code();
            tracing::warn!(uuid = %uuid, error = %e, "snapshot save failed");
            self.message_bus.dispatch(
                Message::new(format!("snapshot save failed: {e}"), code)
                    .for_aggregate(uuid)
                    .with_error(e.into()),
            );
        }
    }
}

fn runtime_handle() -> Result<tokio::runtime::Handle, StoreError> {
    // The store traits are synchronous, but Postgres operations require async.
    // This works when called from within a tokio runtime (e.g. blocking tasks
    // spawned by an async host).
    tokio::runtime::Handle::try_current().map_err(|_| {
        StoreError::backend(
            "runtime",
            "Postgres stores require an async runtime (tokio). Ensure you're calling from within a tokio runtime context.",
        )
    })
}

async fn insert_stream_row(
    tx: &mut Transaction<'_, Postgres>,
    event: &StreamEvent,
) -> Result<(), StoreError> {
    let user: Option<Uuid> = event.user.map(Uuid::from);
    sqlx::query(
        r#"
        INSERT INTO event_stream (
            uuid,
            version,
            command_uuid,
            user_id,
            event_type,
            aggregate_type,
            payload,
            message,
            created
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(event.uuid.as_uuid())
    .bind(event.version as i64)
    .bind(event.command_uuid.as_uuid())
    .bind(user)
    .bind(event.event_type.as_str())
    .bind(event.aggregate_type.as_str())
    .bind(&event.payload)
    .bind(&event.message)
    .bind(event.created)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        // The primary key doubles as the optimistic concurrency check.
        if is_unique_violation(&e) {
            StoreError::Conflict {
                uuid: event.uuid,
                version: event.version,
            }
        } else {
            map_sqlx_error("insert_stream_row", e)
        }
    })?;
    Ok(())
}

async fn insert_queue_row(
    tx: &mut Transaction<'_, Postgres>,
    queued: &QueuedEvent,
) -> Result<(), StoreError> {
    let event = queued.stream();
    sqlx::query(
        r#"
        INSERT INTO event_queue (
            uuid,
            version,
            command_uuid,
            user_id,
            event_type,
            aggregate_type,
            payload,
            message,
            created
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(event.uuid.as_uuid())
    .bind(event.version as i64)
    .bind(event.command_uuid.as_uuid())
    .bind(queued.user().as_uuid())
    .bind(event.event_type.as_str())
    .bind(event.aggregate_type.as_str())
    .bind(&event.payload)
    .bind(&event.message)
    .bind(event.created)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict {
                uuid: event.uuid,
                version: event.version,
            }
        } else {
            map_sqlx_error("insert_queue_row", e)
        }
    })?;
    Ok(())
}

async fn delete_queue_row(
    tx: &mut Transaction<'_, Postgres>,
    uuid: AggregateId,
    user: UserId,
    version: u64,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM event_queue WHERE uuid = $1 AND user_id = $2 AND version = $3")
        .bind(uuid.as_uuid())
        .bind(user.as_uuid())
        .bind(version as i64)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("delete_queue_row", e))?;
    Ok(())
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::backend(operation, format!("database error: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => StoreError::backend(operation, "connection pool closed"),
        sqlx::Error::RowNotFound => {
            // Should not happen: queries use fetch_optional/fetch_all.
            StoreError::backend(operation, "unexpected row not found")
        }
        other => StoreError::backend(operation, format!("sqlx error: {other}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct StreamEventRow {
    uuid: Uuid,
    version: i64,
    command_uuid: Uuid,
    user_id: Option<Uuid>,
    event_type: String,
    aggregate_type: String,
    payload: serde_json::Value,
    message: String,
    created: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for StreamEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StreamEventRow {
            uuid: row.try_get("uuid")?,
            version: row.try_get("version")?,
            command_uuid: row.try_get("command_uuid")?,
            user_id: row.try_get("user_id")?,
            event_type: row.try_get("event_type")?,
            aggregate_type: row.try_get("aggregate_type")?,
            payload: row.try_get("payload")?,
            message: row.try_get("message")?,
            created: row.try_get("created")?,
        })
    }
}

impl From<StreamEventRow> for StreamEvent {
    fn from(row: StreamEventRow) -> Self {
        StreamEvent {
            uuid: AggregateId::from_uuid(row.uuid),
            command_uuid: CommandId::from_uuid(row.command_uuid),
            version: row.version as u64,
            created: row.created,
            event_type: TypeTag::from(row.event_type),
            aggregate_type: TypeTag::from(row.aggregate_type),
            user: row.user_id.map(UserId::from_uuid),
            payload: row.payload,
            message: row.message,
        }
    }
}

#[derive(Debug)]
struct SnapshotRow {
    uuid: Uuid,
    version: i64,
    aggregate_type: String,
    state: serde_json::Value,
    history: serde_json::Value,
    aggregate_created: Option<DateTime<Utc>>,
    aggregate_modified: Option<DateTime<Utc>>,
    created: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for SnapshotRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(SnapshotRow {
            uuid: row.try_get("uuid")?,
            version: row.try_get("version")?,
            aggregate_type: row.try_get("aggregate_type")?,
            state: row.try_get("state")?,
            history: row.try_get("history")?,
            aggregate_created: row.try_get("aggregate_created")?,
            aggregate_modified: row.try_get("aggregate_modified")?,
            created: row.try_get("created")?,
        })
    }
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = StoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, StoreError> {
        let history: Vec<HistoryEntry> = serde_json::from_value(row.history)?;
        Ok(Snapshot {
            uuid: AggregateId::from_uuid(row.uuid),
            version: row.version as u64,
            aggregate_type: TypeTag::from(row.aggregate_type),
            state: row.state,
            aggregate_created: row.aggregate_created,
            aggregate_modified: row.aggregate_modified,
            created: row.created,
            history,
        })
    }
}
