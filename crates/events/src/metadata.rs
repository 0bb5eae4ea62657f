//! Per-event metadata, stored out-of-line and bound to the event's lifetime.
//!
//! Two independent tiers are kept for every fired event:
//!
//! - **persistent**: built once by folding the registered factories, written to the
//!   event log next to the event, and restored onto the event during replay
//! - **ephemeral**: process-local scratch data (e.g. the results of handling the
//!   event); never persisted, never folded through factories
//!
//! Both tiers are `WeakKeyMap`s keyed by the event's `Arc`, so neither keeps the event
//! alive and neither needs an explicit removal call.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::trace;

use crate::weak_map::WeakKeyMap;

/// Ephemeral key holding the results of `Dispatcher::handle`.
pub const LAST_RESULTS_KEY: &str = "_last_results";

/// Key → JSON bag. Later writes to a key replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, JsonValue>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Look up a dotted path: `"audit.actor"` reads `actor` inside the `audit` object.
    /// Numeric segments index into arrays.
    pub fn get_path(&self, path: &str) -> Option<&JsonValue> {
        if let Some(v) = self.0.get(path) {
            return Some(v);
        }

        let mut segments = path.split('.');
        let mut current = self.0.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                JsonValue::Object(map) => map.get(segment)?,
                JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) -> Option<JsonValue> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        self.0.remove(key)
    }

    /// Merge another bag into this one; its keys win.
    pub fn merge(&mut self, other: Metadata) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.0.clone().into_iter().collect())
    }

    /// Merge a JSON contribution: an object, or an array of `[key, value]` pairs.
    fn merge_json(&mut self, value: JsonValue) -> Result<(), &'static str> {
        match value {
            JsonValue::Null => Ok(()),
            JsonValue::Object(map) => {
                self.0.extend(map);
                Ok(())
            }
            JsonValue::Array(items) => {
                let mut pairs = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        JsonValue::Array(pair) if pair.len() == 2 => {
                            let mut pair = pair.into_iter();
                            match (pair.next(), pair.next()) {
                                (Some(JsonValue::String(k)), Some(v)) => pairs.push((k, v)),
                                _ => return Err("an array with a non-string key"),
                            }
                        }
                        _ => return Err("an array that is not made of [key, value] pairs"),
                    }
                }
                self.0.extend(pairs);
                Ok(())
            }
            JsonValue::Bool(_) => Err("a boolean"),
            JsonValue::Number(_) => Err("a number"),
            JsonValue::String(_) => Err("a string"),
        }
    }
}

impl FromIterator<(String, JsonValue)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, JsonValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What a metadata factory hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum Contribution {
    /// Replace the metadata built so far.
    Replace(Metadata),
    /// Merge JSON into the metadata built so far.
    Merge(JsonValue),
    /// Leave the metadata as it is.
    Keep,
}

impl From<Metadata> for Contribution {
    fn from(value: Metadata) -> Self {
        Contribution::Replace(value)
    }
}

impl From<JsonValue> for Contribution {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Contribution::Keep,
            other => Contribution::Merge(other),
        }
    }
}

impl From<()> for Contribution {
    fn from(_: ()) -> Self {
        Contribution::Keep
    }
}

impl<T: Into<Contribution>> From<Option<T>> for Contribution {
    fn from(value: Option<T>) -> Self {
        value.map_or(Contribution::Keep, Into::into)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// A factory merged something that is neither an object nor a list of pairs.
    #[error(
        "metadata factory #{factory} returned {found}; expected metadata, an object, a list of [key, value] pairs, or nothing"
    )]
    ContractViolation { factory: usize, found: &'static str },
}

/// A registered metadata factory: sees the metadata built so far and the event.
pub type MetadataFactory<E> = Arc<dyn Fn(&Metadata, &E) -> Contribution + Send + Sync>;

/// Computes, caches, and stores metadata for events.
///
/// Factories run while the persistent table is locked, so they run exactly once per
/// event even under concurrent first access. They must not call back into the
/// manager.
pub struct MetadataManager<E> {
    persistent: Mutex<WeakKeyMap<E, Metadata>>,
    ephemeral: Mutex<WeakKeyMap<E, Metadata>>,
    factories: RwLock<Vec<MetadataFactory<E>>>,
}

impl<E> MetadataManager<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Factories fold in registration order.
    pub fn create_metadata_using<C>(&self, factory: impl Fn(&Metadata, &E) -> C + Send + Sync + 'static)
    where
        C: Into<Contribution> + 'static,
        E: 'static,
    {
        let wrapped: MetadataFactory<E> =
            Arc::new(move |m: &Metadata, e: &E| -> Contribution { factory(m, e).into() });
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(wrapped);
    }

    /// Forget every registered factory. Already-initialized events keep their metadata.
    pub fn clear_metadata_factories(&self) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn factory_count(&self) -> usize {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Persistent metadata for `event`, built on first access and cached after.
    pub fn initialize(&self, event: &Arc<E>) -> Result<Metadata, MetadataError> {
        let mut persistent = lock(&self.persistent);
        if let Some(existing) = persistent.get(event) {
            return Ok(existing.clone());
        }

        let metadata = self.make_metadata(event)?;
        persistent.insert(event, metadata.clone());
        Ok(metadata)
    }

    pub fn get(&self, event: &Arc<E>) -> Result<Metadata, MetadataError> {
        self.initialize(event)
    }

    /// One value (dotted paths allowed) from the persistent metadata.
    pub fn get_value(&self, event: &Arc<E>, key: &str) -> Result<Option<JsonValue>, MetadataError> {
        Ok(self.initialize(event)?.get_path(key).cloned())
    }

    pub fn get_or(
        &self,
        event: &Arc<E>,
        key: &str,
        default: JsonValue,
    ) -> Result<JsonValue, MetadataError> {
        Ok(self.get_value(event, key)?.unwrap_or(default))
    }

    /// Overwrite the persistent metadata (factories will not run for this event).
    pub fn set(&self, event: &Arc<E>, metadata: Metadata) -> &Self {
        lock(&self.persistent).insert(event, metadata);
        self
    }

    pub fn get_ephemeral(&self, event: &Arc<E>, key: &str, default: JsonValue) -> JsonValue {
        lock(&self.ephemeral)
            .get(event)
            .and_then(|m| m.get_path(key).cloned())
            .unwrap_or(default)
    }

    pub fn set_ephemeral(&self, event: &Arc<E>, key: impl Into<String>, value: JsonValue) -> &Self {
        lock(&self.ephemeral)
            .get_or_insert_with(event, Metadata::new)
            .insert(key, value);
        self
    }

    pub fn set_last_results(&self, event: &Arc<E>, results: Vec<JsonValue>) -> &Self {
        self.set_ephemeral(event, LAST_RESULTS_KEY, JsonValue::Array(results))
    }

    pub fn get_last_results(&self, event: &Arc<E>) -> Vec<JsonValue> {
        match self.get_ephemeral(event, LAST_RESULTS_KEY, JsonValue::Null) {
            JsonValue::Array(results) => results,
            _ => Vec::new(),
        }
    }

    /// Live entries per tier `(persistent, ephemeral)`, after dropping dead ones.
    pub fn tracked(&self) -> (usize, usize) {
        let mut persistent = lock(&self.persistent);
        let mut ephemeral = lock(&self.ephemeral);
        persistent.purge();
        ephemeral.purge();
        (persistent.len(), ephemeral.len())
    }

    fn make_metadata(&self, event: &E) -> Result<Metadata, MetadataError> {
        let factories = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut metadata = Metadata::new();
        for (index, factory) in factories.iter().enumerate() {
            match factory(&metadata, event) {
                Contribution::Replace(replacement) => metadata = replacement,
                Contribution::Merge(value) => metadata
                    .merge_json(value)
                    .map_err(|found| MetadataError::ContractViolation {
                        factory: index,
                        found,
                    })?,
                Contribution::Keep => {}
            }
        }

        trace!(factories = factories.len(), keys = metadata.len(), "metadata built");
        Ok(metadata)
    }
}

impl<E> Default for MetadataManager<E> {
    fn default() -> Self {
        Self {
            persistent: Mutex::new(WeakKeyMap::new()),
            ephemeral: Mutex::new(WeakKeyMap::new()),
            factories: RwLock::new(Vec::new()),
        }
    }
}

impl<E> core::fmt::Debug for MetadataManager<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MetadataManager")
            .field("factories", &self.factory_count())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Entries are only inserted after a factory fold succeeds; a panicking factory
    // leaves the table untouched.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
