use std::collections::BTreeMap;
use std::sync::RwLock;

use eventline_core::StateKey;

use super::{Snapshot, SnapshotError, SnapshotStore, SnapshotWrite};

/// In-memory snapshot store.
///
/// Intended for tests/dev. Batches are validated in full before anything is written.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<BTreeMap<StateKey, Snapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn load(&self, key: &StateKey) -> Result<Option<Snapshot>, SnapshotError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| SnapshotError::Storage("lock poisoned".to_string()))?;
        Ok(snapshots.get(key).cloned())
    }

    fn write_batch(&self, writes: Vec<SnapshotWrite>) -> Result<usize, SnapshotError> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| SnapshotError::Storage("lock poisoned".to_string()))?;

        for write in &writes {
            let key = &write.snapshot.key;
            let current = snapshots.get(key).map(|s| s.version).unwrap_or(0);
            if !write.expected.matches(current) {
                return Err(SnapshotError::Conflict(format!(
                    "{key}: expected {:?}, found {current}",
                    write.expected
                )));
            }
        }

        let written = writes.len();
        for write in writes {
            snapshots.insert(write.snapshot.key.clone(), write.snapshot);
        }
        Ok(written)
    }

    fn clear(&self) -> Result<(), SnapshotError> {
        self.snapshots
            .write()
            .map_err(|_| SnapshotError::Storage("lock poisoned".to_string()))?
            .clear();
        Ok(())
    }
}
