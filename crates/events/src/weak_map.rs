//! Association table keyed by the identity of an `Arc` allocation.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Map from a shared value's identity to data about it, without owning the value.
///
/// Each entry holds a `Weak` to its key. While the entry exists the key's allocation
/// cannot be freed and reused, so the allocation address is an exact identity. Once
/// every `Arc` to a key is gone the entry is dead: lookups ignore it, and its value is
/// dropped by an explicit `purge` or by the sweep an insert runs once the table has
/// doubled since the last sweep.
#[derive(Debug)]
pub struct WeakKeyMap<K, V> {
    entries: HashMap<usize, Entry<K, V>>,
    sweep_at: usize,
}

/// Smallest table size that triggers a sweep on insert.
const MIN_SWEEP_AT: usize = 64;

#[derive(Debug)]
struct Entry<K, V> {
    key: Weak<K>,
    value: V,
}

impl<K, V> Entry<K, V> {
    fn is_live(&self) -> bool {
        self.key.strong_count() > 0
    }
}

fn identity<K>(key: &Arc<K>) -> usize {
    Arc::as_ptr(key) as usize
}

impl<K, V> WeakKeyMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Arc<K>) -> Option<&V> {
        self.entries
            .get(&identity(key))
            .filter(|e| e.is_live())
            .map(|e| &e.value)
    }

    pub fn get_mut(&mut self, key: &Arc<K>) -> Option<&mut V> {
        self.entries
            .get_mut(&identity(key))
            .filter(|e| e.is_live())
            .map(|e| &mut e.value)
    }

    /// Associate `value` with `key`, replacing any previous value.
    pub fn insert(&mut self, key: &Arc<K>, value: V) -> Option<V> {
        self.sweep_if_grown();
        self.entries
            .insert(
                identity(key),
                Entry {
                    key: Arc::downgrade(key),
                    value,
                },
            )
            .map(|e| e.value)
    }

    /// Value for `key`, inserting `make()` first if there is none.
    pub fn get_or_insert_with(&mut self, key: &Arc<K>, make: impl FnOnce() -> V) -> &mut V {
        // A dead entry pins its allocation, so any entry at this address is `key`'s.
        self.sweep_if_grown();
        &mut self
            .entries
            .entry(identity(key))
            .or_insert_with(|| Entry {
                key: Arc::downgrade(key),
                value: make(),
            })
            .value
    }

    pub fn remove(&mut self, key: &Arc<K>) -> Option<V> {
        self.entries.remove(&identity(key)).map(|e| e.value)
    }

    /// Drop every entry whose key is gone. Returns how many were dropped.
    pub fn purge(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live());
        self.sweep_at = (self.entries.len() * 2).max(MIN_SWEEP_AT);
        before - self.entries.len()
    }

    fn sweep_if_grown(&mut self) {
        if self.entries.len() >= self.sweep_at {
            self.purge();
        }
    }

    /// Number of entries whose key is still alive.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for WeakKeyMap<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            sweep_at: MIN_SWEEP_AT,
        }
    }
}
