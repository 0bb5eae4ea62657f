use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use eventline_core::{ExpectedVersion, State, StateCell, StateHandle, StateKey};

use super::{StateRegistry, StateRegistryError};
use crate::snapshot_store::{Snapshot, SnapshotError, SnapshotStore, SnapshotWrite};

/// State registry that keeps loaded cells in memory and persists them through a
/// `SnapshotStore`.
///
/// States are restored from their latest snapshot on first load. Snapshot writes
/// expect the store to still be at the version this registry last persisted, so a
/// second process writing the same key is detected as a conflict.
#[derive(Debug)]
pub struct SnapshotStateRegistry<S, St> {
    store: St,
    states: RwLock<BTreeMap<StateKey, StateHandle<S>>>,
    replaying: AtomicBool,
}

impl<S, St> SnapshotStateRegistry<S, St> {
    pub fn new(store: St) -> Self {
        Self {
            store,
            states: RwLock::new(BTreeMap::new()),
            replaying: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &St {
        &self.store
    }
}

impl<S, St> SnapshotStateRegistry<S, St>
where
    S: State + DeserializeOwned,
    St: SnapshotStore,
{
    fn restore(&self, key: &StateKey) -> Result<StateCell<S>, StateRegistryError> {
        match self.store.load(key)? {
            Some(snapshot) => {
                let state = serde_json::from_value(snapshot.state).map_err(|e| {
                    StateRegistryError::Restore {
                        key: key.clone(),
                        reason: e.to_string(),
                    }
                })?;
                debug!(state_key = %key, version = snapshot.version, "state restored from snapshot");
                Ok(StateCell::restored(key.clone(), state, snapshot.version))
            }
            None => Ok(StateCell::new(key.clone(), S::initial(key))),
        }
    }
}

impl<S, St> StateRegistry<S> for SnapshotStateRegistry<S, St>
where
    S: State + Serialize + DeserializeOwned,
    St: SnapshotStore,
{
    fn load(&self, key: &StateKey) -> Result<StateHandle<S>, StateRegistryError> {
        {
            let states = self.states.read().map_err(|_| StateRegistryError::Poisoned)?;
            if let Some(cell) = states.get(key) {
                return Ok(cell.clone());
            }
        }

        // Restore outside the write lock; if another caller won the race, keep theirs.
        let restored = Arc::new(self.restore(key)?);
        let mut states = self.states.write().map_err(|_| StateRegistryError::Poisoned)?;
        Ok(states.entry(key.clone()).or_insert(restored).clone())
    }

    fn loaded(&self) -> Vec<StateKey> {
        self.states
            .read()
            .map(|states| states.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[instrument(skip(self), err)]
    fn write_snapshots(&self) -> Result<usize, SnapshotError> {
        let cells: Vec<StateHandle<S>> = self
            .states
            .read()
            .map_err(|_| SnapshotError::Storage("state registry lock poisoned".to_string()))?
            .values()
            .filter(|cell| cell.is_dirty())
            .cloned()
            .collect();

        let mut writes = Vec::with_capacity(cells.len());
        for cell in &cells {
            let (state, version) = cell.read_versioned(|state, version| {
                (serde_json::to_value(state), version)
            });
            let state = state.map_err(|e| SnapshotError::Serialization(e.to_string()))?;
            writes.push(SnapshotWrite {
                snapshot: Snapshot {
                    key: cell.key().clone(),
                    version,
                    state,
                    written_at: Utc::now(),
                },
                expected: ExpectedVersion::Exact(cell.persisted_version()),
            });
        }

        if writes.is_empty() {
            return Ok(0);
        }

        let versions: Vec<u64> = writes.iter().map(|w| w.snapshot.version).collect();
        let written = self.store.write_batch(writes)?;
        for (cell, version) in cells.iter().zip(versions) {
            cell.mark_persisted(version);
        }

        debug!(written, "snapshots written");
        Ok(written)
    }

    fn reset(&self, include_storage: bool) -> Result<(), StateRegistryError> {
        self.states
            .write()
            .map_err(|_| StateRegistryError::Poisoned)?
            .clear();
        if include_storage {
            self.store.clear()?;
        }
        Ok(())
    }

    fn set_replaying(&self, replaying: bool) {
        self.replaying.store(replaying, Ordering::Release);
    }

    fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::Acquire)
    }
}
