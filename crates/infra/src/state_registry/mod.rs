//! Loaded state aggregates and their durable snapshots.

use std::sync::Arc;

use thiserror::Error;

use eventline_core::{State, StateHandle, StateKey};

use crate::snapshot_store::SnapshotError;

pub mod snapshotting;

pub use snapshotting::SnapshotStateRegistry;

#[derive(Debug, Error)]
pub enum StateRegistryError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("failed to restore state {key} from its snapshot: {reason}")]
    Restore { key: StateKey, reason: String },

    #[error("state registry lock poisoned")]
    Poisoned,
}

/// Tracks which states are loaded and persists the dirty ones.
pub trait StateRegistry<S: State>: Send + Sync {
    /// The cell for `key`, loading it on first use. A key is loaded at most once.
    fn load(&self, key: &StateKey) -> Result<StateHandle<S>, StateRegistryError>;

    /// Keys of every loaded state, in key order.
    fn loaded(&self) -> Vec<StateKey>;

    /// Snapshot every dirty state in one all-or-nothing batch. Returns how many were
    /// written.
    fn write_snapshots(&self) -> Result<usize, SnapshotError>;

    /// Forget every loaded state; with `include_storage`, delete stored snapshots too.
    fn reset(&self, include_storage: bool) -> Result<(), StateRegistryError>;

    fn set_replaying(&self, replaying: bool);

    fn is_replaying(&self) -> bool;
}

impl<S, R> StateRegistry<S> for Arc<R>
where
    S: State,
    R: StateRegistry<S> + ?Sized,
{
    fn load(&self, key: &StateKey) -> Result<StateHandle<S>, StateRegistryError> {
        (**self).load(key)
    }

    fn loaded(&self) -> Vec<StateKey> {
        (**self).loaded()
    }

    fn write_snapshots(&self) -> Result<usize, SnapshotError> {
        (**self).write_snapshots()
    }

    fn reset(&self, include_storage: bool) -> Result<(), StateRegistryError> {
        (**self).reset(include_storage)
    }

    fn set_replaying(&self, replaying: bool) {
        (**self).set_replaying(replaying)
    }

    fn is_replaying(&self) -> bool {
        (**self).is_replaying()
    }
}
