//! Postgres-backed snapshot store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | SnapshotError | Scenario |
//! |------------|----------------------|---------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Two writers created the same key's first snapshot |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | Other | N/A | `Storage` | Pool closed, network errors, etc. |
//!
//! A version mismatch detected under `SELECT ... FOR UPDATE` is also a `Conflict`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use eventline_core::{ExpectedVersion, StateKey};

use super::{Snapshot, SnapshotError, SnapshotStore, SnapshotWrite};

/// DDL for the table this store reads and writes.
pub const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS state_snapshots (
    state_key  TEXT PRIMARY KEY,
    version    BIGINT NOT NULL CHECK (version >= 0),
    state      JSONB NOT NULL,
    written_at TIMESTAMPTZ NOT NULL
)
"#;

#[derive(Debug, Clone)]
pub struct PostgresSnapshotStore {
    pool: Arc<PgPool>,
}

#[derive(Debug)]
struct SnapshotRow {
    state_key: String,
    version: i64,
    state: JsonValue,
    written_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for SnapshotRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SnapshotRow {
            state_key: row.try_get("state_key")?,
            version: row.try_get("version")?,
            state: row.try_get("state")?,
            written_at: row.try_get("written_at")?,
        })
    }
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<Snapshot, SnapshotError> {
        Ok(Snapshot {
            key: StateKey::new(self.state_key),
            version: u64::try_from(self.version).map_err(|_| {
                SnapshotError::Storage(format!("negative snapshot version {}", self.version))
            })?,
            state: self.state,
            written_at: self.written_at,
        })
    }
}

impl PostgresSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the snapshot table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), SnapshotError> {
        sqlx::query(SNAPSHOT_SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(state_key = %key), err)]
    pub async fn load_snapshot(&self, key: &StateKey) -> Result<Option<Snapshot>, SnapshotError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT state_key, version, state, written_at
            FROM state_snapshots
            WHERE state_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_snapshot", e))?;

        row.map(SnapshotRow::into_snapshot).transpose()
    }

    /// Write a batch of snapshots in one transaction.
    ///
    /// Every key's current version is read with `FOR UPDATE` and compared against its
    /// expectation before the write, so a concurrent writer either blocks or is detected.
    #[instrument(skip(self, writes), fields(snapshot_count = writes.len()), err)]
    pub async fn write_snapshots(&self, writes: Vec<SnapshotWrite>) -> Result<usize, SnapshotError> {
        if writes.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let written = writes.len();
        for write in writes {
            write_one(&mut tx, write).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(written)
    }

    #[instrument(skip(self), err)]
    pub async fn clear_snapshots(&self) -> Result<(), SnapshotError> {
        sqlx::query("DELETE FROM state_snapshots")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear_snapshots", e))?;
        Ok(())
    }
}

async fn write_one(
    tx: &mut Transaction<'_, Postgres>,
    write: SnapshotWrite,
) -> Result<(), SnapshotError> {
    let SnapshotWrite { snapshot, expected } = write;
    let version = i64::try_from(snapshot.version)
        .map_err(|_| SnapshotError::Storage(format!("version {} out of range", snapshot.version)))?;

    let current: Option<i64> = sqlx::query_scalar(
        "SELECT version FROM state_snapshots WHERE state_key = $1 FOR UPDATE",
    )
    .bind(snapshot.key.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_snapshot_row", e))?;

    let current_version = current.map(|v| v.max(0) as u64).unwrap_or(0);
    if !expected.matches(current_version) {
        return Err(SnapshotError::Conflict(format!(
            "{}: expected {expected:?}, found {current_version}",
            snapshot.key
        )));
    }

    let query = if current.is_some() {
        r#"
        UPDATE state_snapshots
        SET version = $2, state = $3, written_at = $4
        WHERE state_key = $1
        "#
    } else {
        // A plain insert: a concurrent first write surfaces as a unique violation.
        r#"
        INSERT INTO state_snapshots (state_key, version, state, written_at)
        VALUES ($1, $2, $3, $4)
        "#
    };

    sqlx::query(query)
        .bind(snapshot.key.as_str())
        .bind(version)
        .bind(&snapshot.state)
        .bind(snapshot.written_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("write_snapshot", e))?;

    if matches!(expected, ExpectedVersion::Any) {
        tracing::debug!(state_key = %snapshot.key, version, "snapshot written without version check");
    }
    Ok(())
}

impl SnapshotStore for PostgresSnapshotStore {
    fn load(&self, key: &StateKey) -> Result<Option<Snapshot>, SnapshotError> {
        block_on_runtime()?.block_on(self.load_snapshot(key))
    }

    fn write_batch(&self, writes: Vec<SnapshotWrite>) -> Result<usize, SnapshotError> {
        block_on_runtime()?.block_on(self.write_snapshots(writes))
    }

    fn clear(&self) -> Result<(), SnapshotError> {
        block_on_runtime()?.block_on(self.clear_snapshots())
    }
}

fn block_on_runtime() -> Result<tokio::runtime::Handle, SnapshotError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        SnapshotError::Storage(
            "PostgresSnapshotStore requires async runtime (tokio). Ensure you're calling from within a tokio runtime context.".to_string(),
        )
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SnapshotError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => SnapshotError::Conflict(msg),
                _ => SnapshotError::Storage(msg),
            }
        }
        other => SnapshotError::Storage(format!("{operation}: {other}")),
    }
}
