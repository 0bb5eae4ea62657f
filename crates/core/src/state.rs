//! State aggregates and the cells that hold them in memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{DomainError, DomainResult};
use crate::id::StateKey;

/// A state aggregate: a mutable projection of the events that targeted its key.
///
/// States are loaded lazily by a state registry and mutated only by applying events.
/// They must not perform IO; durable persistence happens through snapshots.
pub trait State: core::fmt::Debug + Send + Sync + 'static {
    /// The state a key starts in before any event has been applied to it.
    fn initial(key: &StateKey) -> Self;
}

/// Optimistic concurrency expectation for a snapshot write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking: the write wins over whatever is stored. The state
    /// registry never writes with it; it is for callers seeding or repairing a store.
    Any,
    /// Require the stored snapshot to be at an exact version (0 = no snapshot yet).
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

/// Shared handle to a loaded state.
pub type StateHandle<S> = Arc<StateCell<S>>;

/// In-memory home of one loaded state.
///
/// `version` counts applied events (starting from the restored snapshot version);
/// `persisted_version` is the version last written durably. The cell is dirty while
/// the two differ.
#[derive(Debug)]
pub struct StateCell<S> {
    key: StateKey,
    state: Mutex<S>,
    version: AtomicU64,
    persisted_version: AtomicU64,
}

impl<S> StateCell<S> {
    /// A brand-new state that has never been persisted.
    pub fn new(key: StateKey, state: S) -> Self {
        Self::restored(key, state, 0)
    }

    /// A state rebuilt from a snapshot taken at `version`.
    pub fn restored(key: StateKey, state: S, version: u64) -> Self {
        Self {
            key,
            state: Mutex::new(state),
            version: AtomicU64::new(version),
            persisted_version: AtomicU64::new(version),
        }
    }

    pub fn key(&self) -> &StateKey {
        &self.key
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn persisted_version(&self) -> u64 {
        self.persisted_version.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.version() != self.persisted_version()
    }

    /// Mutate the state and bump its version, atomically with respect to readers.
    pub fn apply<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut guard = self.lock();
        let out = f(&mut guard);
        self.version.fetch_add(1, Ordering::AcqRel);
        out
    }

    /// Read the state without mutating it.
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let guard = self.lock();
        f(&guard)
    }

    /// Read the state together with the version it is at.
    ///
    /// The version is sampled while the state mutex is held, so it always matches the
    /// value passed to `f`.
    pub fn read_versioned<R>(&self, f: impl FnOnce(&S, u64) -> R) -> R {
        let guard = self.lock();
        f(&guard, self.version())
    }

    /// Record that `version` has been written durably.
    pub fn mark_persisted(&self, version: u64) {
        self.persisted_version.store(version, Ordering::Release);
    }

    fn lock(&self) -> MutexGuard<'_, S> {
        // A panic inside an apply closure must not wedge the aggregate forever.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
