//! Postgres-backed event log.
//!
//! Events are stored as JSON payloads next to their persistent metadata. `event_id`
//! is unique, and appends use `ON CONFLICT (event_id) DO NOTHING`, so re-appending a
//! batch after a failed commit only writes the events that are missing.
//!
//! Reads are paged by `position` and pulled lazily as the returned stream is consumed.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use eventline_events::{Event, Metadata};

use super::{EventLog, EventLogError, EventStream, LoggedEvent};

/// DDL for the table this log reads and writes.
pub const EVENT_LOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS event_log (
    position      BIGSERIAL PRIMARY KEY,
    event_id      UUID NOT NULL UNIQUE,
    event_type    TEXT NOT NULL,
    event_version INTEGER NOT NULL,
    occurred_at   TIMESTAMPTZ NOT NULL,
    payload       JSONB NOT NULL,
    metadata      JSONB NOT NULL DEFAULT '{}'::jsonb,
    recorded_at   TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const DEFAULT_PAGE_SIZE: i64 = 500;

pub struct PostgresEventLog<E> {
    pool: Arc<PgPool>,
    page_size: i64,
    _event: PhantomData<fn() -> E>,
}

impl<E> Clone for PostgresEventLog<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            page_size: self.page_size,
            _event: PhantomData,
        }
    }
}

impl<E> core::fmt::Debug for PostgresEventLog<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresEventLog")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct LogRow {
    position: i64,
    payload: JsonValue,
    metadata: JsonValue,
}

impl<'r> FromRow<'r, PgRow> for LogRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LogRow {
            position: row.try_get("position")?,
            payload: row.try_get("payload")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

impl<E> PostgresEventLog<E>
where
    E: Event + Serialize + DeserializeOwned,
{
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            page_size: DEFAULT_PAGE_SIZE,
            _event: PhantomData,
        }
    }

    /// Rows fetched per round trip while reading.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = i64::from(page_size.max(1));
        self
    }

    /// Create the log table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), EventLogError> {
        sqlx::query(EVENT_LOG_SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Append a batch in one transaction, skipping events that are already logged.
    #[instrument(skip(self, batch), fields(event_count = batch.len()), err)]
    pub async fn append_events(&self, batch: &[(Arc<E>, Metadata)]) -> Result<usize, EventLogError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut written = 0u64;
        for (event, metadata) in batch {
            let payload = serde_json::to_value(&**event)
                .map_err(|e| EventLogError::Serialization(e.to_string()))?;
            let metadata = serde_json::to_value(metadata)
                .map_err(|e| EventLogError::Serialization(e.to_string()))?;

            let result = sqlx::query(
                r#"
                INSERT INTO event_log (event_id, event_type, event_version, occurred_at, payload, metadata)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(*event.event_id().as_uuid())
            .bind(event.event_type())
            .bind(i32::try_from(event.version()).unwrap_or(i32::MAX))
            .bind(event.occurred_at())
            .bind(payload)
            .bind(metadata)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("append_event", e))?;

            written += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(usize::try_from(written).unwrap_or(usize::MAX))
    }

    /// One page of the log, strictly after `after`.
    #[instrument(skip(self), err)]
    pub async fn read_page(&self, after: i64) -> Result<Vec<LoggedEvent<E>>, EventLogError> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT position, payload, metadata
            FROM event_log
            WHERE position > $1
            ORDER BY position ASC
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(self.page_size)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_page", e))?;

        rows.into_iter().map(decode_row).collect()
    }
}

fn decode_row<E: DeserializeOwned>(row: LogRow) -> Result<LoggedEvent<E>, EventLogError> {
    let event: E = serde_json::from_value(row.payload).map_err(|e| {
        EventLogError::Serialization(format!("event at position {}: {e}", row.position))
    })?;
    let metadata: Metadata = serde_json::from_value(row.metadata).map_err(|e| {
        EventLogError::Serialization(format!("metadata at position {}: {e}", row.position))
    })?;

    Ok(LoggedEvent {
        position: u64::try_from(row.position).unwrap_or_default(),
        event: Arc::new(event),
        metadata,
    })
}

impl<E> EventLog<E> for PostgresEventLog<E>
where
    E: Event + Serialize + DeserializeOwned,
{
    fn append(&self, batch: &[(Arc<E>, Metadata)]) -> Result<usize, EventLogError> {
        runtime_handle()?.block_on(self.append_events(batch))
    }

    fn read(&self) -> Result<EventStream<'_, E>, EventLogError> {
        Ok(Box::new(PagedRead {
            log: self,
            handle: runtime_handle()?,
            after: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }
}

/// Iterator that fetches the next page whenever its buffer runs dry.
struct PagedRead<'a, E> {
    log: &'a PostgresEventLog<E>,
    handle: tokio::runtime::Handle,
    after: i64,
    buffer: VecDeque<LoggedEvent<E>>,
    exhausted: bool,
}

impl<E> Iterator for PagedRead<'_, E>
where
    E: Event + Serialize + DeserializeOwned,
{
    type Item = Result<LoggedEvent<E>, EventLogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.handle.block_on(self.log.read_page(self.after)) {
                Ok(page) => {
                    self.exhausted = (page.len() as i64) < self.log.page_size;
                    if let Some(last) = page.last() {
                        self.after = i64::try_from(last.position).unwrap_or(i64::MAX);
                    }
                    self.buffer.extend(page);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

fn runtime_handle() -> Result<tokio::runtime::Handle, EventLogError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        EventLogError::Storage(
            "PostgresEventLog requires async runtime (tokio). Ensure you're calling from within a tokio runtime context.".to_string(),
        )
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventLogError {
    match err {
        sqlx::Error::Database(db_err) => EventLogError::Storage(format!(
            "database error in {operation} ({}): {}",
            db_err.code().as_deref().unwrap_or("unknown"),
            db_err.message()
        )),
        other => EventLogError::Storage(format!("{operation}: {other}")),
    }
}
