//! Infrastructure layer: the broker and its storage, locking, and config backends.

pub mod broker;
pub mod config;
pub mod event_log;
pub mod lock;
pub mod snapshot_store;
pub mod state_registry;

#[cfg(test)]
mod integration_tests;

pub use broker::{Broker, BrokerError, ConcurrencyError};
pub use config::BrokerConfig;
pub use event_log::{EventLog, EventLogError, EventStream, InMemoryEventLog, LoggedEvent, PostgresEventLog};
pub use lock::{InMemoryLockProvider, Lock, LockError, LockProvider, LockSet};
#[cfg(feature = "redis")]
pub use lock::RedisLockProvider;
pub use snapshot_store::{
    InMemorySnapshotStore, PostgresSnapshotStore, Snapshot, SnapshotError, SnapshotStore,
    SnapshotWrite,
};
pub use state_registry::{SnapshotStateRegistry, StateRegistry, StateRegistryError};
