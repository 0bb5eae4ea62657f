//! Append-only durable log of committed events and their persistent metadata.
//!
//! The log is the source of truth for replay: reading it back in position order and
//! re-applying every event rebuilds all state.

use std::sync::Arc;

use thiserror::Error;

use eventline_events::{Event, Metadata};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryEventLog;
pub use postgres::PostgresEventLog;

/// An event as read back from the log.
#[derive(Debug, Clone)]
pub struct LoggedEvent<E> {
    /// 1-based position in the log.
    pub position: u64,
    pub event: Arc<E>,
    pub metadata: Metadata,
}

/// Lazily-read log contents, in position order.
pub type EventStream<'a, E> = Box<dyn Iterator<Item = Result<LoggedEvent<E>, EventLogError>> + 'a>;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event (de)serialization failed: {0}")]
    Serialization(String),

    #[error("event log storage error: {0}")]
    Storage(String),
}

pub trait EventLog<E: Event>: Send + Sync {
    /// Append a batch atomically. Events whose id is already in the log are skipped,
    /// so retrying a batch is safe. Returns how many events were newly written.
    fn append(&self, batch: &[(Arc<E>, Metadata)]) -> Result<usize, EventLogError>;

    /// Every logged event, oldest first.
    fn read(&self) -> Result<EventStream<'_, E>, EventLogError>;
}

impl<E, L> EventLog<E> for Arc<L>
where
    E: Event,
    L: EventLog<E> + ?Sized,
{
    fn append(&self, batch: &[(Arc<E>, Metadata)]) -> Result<usize, EventLogError> {
        (**self).append(batch)
    }

    fn read(&self) -> Result<EventStream<'_, E>, EventLogError> {
        (**self).read()
    }
}
