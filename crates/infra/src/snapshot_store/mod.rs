//! Durable snapshots of state aggregates.
//!
//! `write_batch` is the transactional boundary of a commit: every snapshot in the
//! batch is written, or none is. Each write carries an `ExpectedVersion` checked
//! against the stored snapshot (0 when there is none yet).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use eventline_core::{ExpectedVersion, StateKey};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemorySnapshotStore;
pub use postgres::PostgresSnapshotStore;

/// A state serialized at a given version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub key: StateKey,
    pub version: u64,
    pub state: JsonValue,
    pub written_at: DateTime<Utc>,
}

/// One entry of a snapshot batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotWrite {
    pub snapshot: Snapshot,
    pub expected: ExpectedVersion,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot version conflict: {0}")]
    Conflict(String),

    #[error("snapshot (de)serialization failed: {0}")]
    Serialization(String),

    #[error("snapshot storage error: {0}")]
    Storage(String),
}

pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot for `key`, if any.
    fn load(&self, key: &StateKey) -> Result<Option<Snapshot>, SnapshotError>;

    /// Write every snapshot or none. Returns how many were written.
    fn write_batch(&self, writes: Vec<SnapshotWrite>) -> Result<usize, SnapshotError>;

    /// Delete every stored snapshot.
    fn clear(&self) -> Result<(), SnapshotError>;
}

impl<S> SnapshotStore for Arc<S>
where
    S: SnapshotStore + ?Sized,
{
    fn load(&self, key: &StateKey) -> Result<Option<Snapshot>, SnapshotError> {
        (**self).load(key)
    }

    fn write_batch(&self, writes: Vec<SnapshotWrite>) -> Result<usize, SnapshotError> {
        (**self).write_batch(writes)
    }

    fn clear(&self) -> Result<(), SnapshotError> {
        (**self).clear()
    }
}
