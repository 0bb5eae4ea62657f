//! Named, TTL-bounded exclusive locks and all-or-nothing lock sets.
//!
//! A commit holds one lock per loaded state key. `LockSet::acquire` takes them in
//! key order and either ends up holding every lock or none: on the first failure the
//! locks already taken are released before the error is returned.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::broker::ConcurrencyError;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::{InMemoryLock, InMemoryLockProvider};
#[cfg(feature = "redis")]
pub use self::redis::{RedisLock, RedisLockProvider};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// One exclusive lease on a name.
pub trait Lock: Send {
    fn name(&self) -> &str;

    /// Try to take the lease without waiting. `Ok(false)` means someone else holds it.
    fn get(&mut self) -> Result<bool, LockError>;

    /// Give the lease back. Releasing a lock that is not held is a no-op.
    fn release(&mut self) -> Result<(), LockError>;
}

/// Creates locks; does not acquire them.
pub trait LockProvider: Send + Sync {
    type Lock: Lock;

    fn lock(&self, name: &str, ttl: Duration) -> Self::Lock;
}

impl<P> LockProvider for Arc<P>
where
    P: LockProvider + ?Sized,
{
    type Lock = P::Lock;

    fn lock(&self, name: &str, ttl: Duration) -> Self::Lock {
        (**self).lock(name, ttl)
    }
}

/// A set of held locks, released (in reverse acquisition order) when dropped.
#[derive(Debug)]
pub struct LockSet<L: Lock> {
    held: Vec<L>,
}

impl<L: Lock> LockSet<L> {
    /// Acquire a lock for every name, in sorted order, or none of them.
    pub fn acquire<P>(
        provider: &P,
        names: impl IntoIterator<Item = String>,
        ttl: Duration,
    ) -> Result<Self, ConcurrencyError>
    where
        P: LockProvider<Lock = L> + ?Sized,
    {
        let mut names: Vec<String> = names.into_iter().collect();
        names.sort();
        names.dedup();

        // Locks taken so far are released by `Drop` if we bail out below.
        let mut set = LockSet {
            held: Vec::with_capacity(names.len()),
        };

        for name in names {
            let mut lock = provider.lock(&name, ttl);
            match lock.get() {
                Ok(true) => set.held.push(lock),
                Ok(false) => {
                    debug!(lock = %name, held = set.held.len(), "lock unavailable, rolling back");
                    return Err(ConcurrencyError::LockUnavailable { name });
                }
                Err(source) => return Err(ConcurrencyError::LockBackend { name, source }),
            }
        }

        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.held.iter().map(Lock::name)
    }
}

impl<L: Lock> Drop for LockSet<L> {
    fn drop(&mut self) {
        while let Some(mut lock) = self.held.pop() {
            if let Err(err) = lock.release() {
                // The lease still expires on its own once the TTL runs out.
                warn!(lock = %lock.name(), error = %err, "failed to release lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn acquires_every_lock_and_releases_on_drop() {
        let provider = InMemoryLockProvider::new();
        let ttl = Duration::from_secs(60);

        let set = LockSet::acquire(&provider, names(&["b", "a", "a"]), ttl).unwrap();
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(provider.is_held("a") && provider.is_held("b"));

        drop(set);

        assert!(!provider.is_held("a"));
        assert!(!provider.is_held("b"));
    }

    #[test]
    fn unavailable_lock_rolls_back_earlier_acquisitions() {
        let provider = InMemoryLockProvider::new();
        let ttl = Duration::from_secs(60);
        let mut blocker = provider.lock("c", ttl);
        assert!(blocker.get().unwrap());

        let err = LockSet::acquire(&provider, names(&["a", "b", "c", "d"]), ttl).unwrap_err();

        assert!(matches!(err, ConcurrencyError::LockUnavailable { ref name } if name == "c"));
        assert!(!provider.is_held("a"));
        assert!(!provider.is_held("b"));
        assert!(!provider.is_held("d"));
        assert!(provider.is_held("c"));
    }

    struct Flaky;

    #[derive(Debug)]
    struct FlakyLock(String);

    impl Lock for FlakyLock {
        fn name(&self) -> &str {
            &self.0
        }

        fn get(&mut self) -> Result<bool, LockError> {
            Err(LockError::Backend("connection reset".into()))
        }

        fn release(&mut self) -> Result<(), LockError> {
            Ok(())
        }
    }

    impl LockProvider for Flaky {
        type Lock = FlakyLock;

        fn lock(&self, name: &str, _ttl: Duration) -> FlakyLock {
            FlakyLock(name.to_string())
        }
    }

    #[test]
    fn backend_errors_are_reported_with_the_lock_name() {
        let err = LockSet::acquire(&Flaky, names(&["x"]), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ConcurrencyError::LockBackend { ref name, .. } if name == "x"));
    }

    proptest! {
        /// Property: with some names already taken, acquisition either holds all requested
        /// names (none were blocked) or leaves the provider exactly as it found it.
        #[test]
        fn acquisition_is_all_or_nothing(
            wanted in prop::collection::btree_set("[a-f]", 0..6),
            blocked in prop::collection::btree_set("[a-f]", 0..3),
        ) {
            let provider = InMemoryLockProvider::new();
            let ttl = Duration::from_secs(60);
            let mut blockers = Vec::new();
            for name in &blocked {
                let mut lock = provider.lock(name, ttl);
                prop_assert!(lock.get().unwrap());
                blockers.push(lock);
            }

            let result = LockSet::acquire(&provider, wanted.iter().cloned(), ttl);
            let conflict = wanted.iter().any(|n| blocked.contains(n));

            match result {
                Ok(set) => {
                    prop_assert!(!conflict);
                    prop_assert_eq!(set.len(), wanted.len());
                    prop_assert_eq!(provider.held_count(), wanted.len() + blocked.len());
                }
                Err(_) => {
                    prop_assert!(conflict);
                    prop_assert_eq!(provider.held_count(), blocked.len());
                }
            }
        }
    }
}
