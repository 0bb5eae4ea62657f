use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::{Lock, LockError, LockProvider};

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: Uuid,
    expires_at: Instant,
}

impl Lease {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

type Leases = Arc<Mutex<HashMap<String, Lease>>>;

/// Process-local lock provider.
///
/// Intended for tests/dev and single-process deployments. Leases expire after their
/// TTL, so a lock that was never released is eventually free again.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockProvider {
    leases: Leases,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is currently leased (and not expired).
    pub fn is_held(&self, name: &str) -> bool {
        let now = Instant::now();
        lock_leases(&self.leases)
            .get(name)
            .is_some_and(|lease| !lease.is_expired(now))
    }

    pub fn held_count(&self) -> usize {
        let now = Instant::now();
        lock_leases(&self.leases)
            .values()
            .filter(|lease| !lease.is_expired(now))
            .count()
    }
}

impl LockProvider for InMemoryLockProvider {
    type Lock = InMemoryLock;

    fn lock(&self, name: &str, ttl: Duration) -> InMemoryLock {
        InMemoryLock {
            name: name.to_string(),
            ttl,
            token: None,
            leases: self.leases.clone(),
        }
    }
}

#[derive(Debug)]
pub struct InMemoryLock {
    name: String,
    ttl: Duration,
    token: Option<Uuid>,
    leases: Leases,
}

impl Lock for InMemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&mut self) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = lock_leases(&self.leases);

        if let Some(existing) = leases.get(&self.name) {
            let ours = Some(existing.token) == self.token;
            if !ours && !existing.is_expired(now) {
                return Ok(false);
            }
        }

        let token = self.token.unwrap_or_else(Uuid::now_v7);
        leases.insert(
            self.name.clone(),
            Lease {
                token,
                expires_at: now + self.ttl,
            },
        );
        self.token = Some(token);
        Ok(true)
    }

    fn release(&mut self) -> Result<(), LockError> {
        let Some(token) = self.token.take() else {
            return Ok(());
        };

        let mut leases = lock_leases(&self.leases);
        // Only remove the lease if it is still ours; it may have expired and been
        // taken over in the meantime.
        if leases.get(&self.name).is_some_and(|lease| lease.token == token) {
            leases.remove(&self.name);
        }
        Ok(())
    }
}

fn lock_leases(leases: &Leases) -> MutexGuard<'_, HashMap<String, Lease>> {
    leases.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let provider = InMemoryLockProvider::new();
        let mut first = provider.lock("state_lock_a1", Duration::from_secs(60));
        let mut second = provider.lock("state_lock_a1", Duration::from_secs(60));

        assert!(first.get().unwrap());
        assert!(!second.get().unwrap());

        first.release().unwrap();

        assert!(second.get().unwrap());
        assert!(provider.is_held("state_lock_a1"));
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let provider = InMemoryLockProvider::new();
        let mut stale = provider.lock("k", Duration::ZERO);
        let mut fresh = provider.lock("k", Duration::from_secs(60));

        assert!(stale.get().unwrap());
        assert!(fresh.get().unwrap());

        // The stale holder must not free the new owner's lease.
        stale.release().unwrap();
        assert!(provider.is_held("k"));
    }

    #[test]
    fn releasing_an_unheld_lock_is_a_no_op() {
        let provider = InMemoryLockProvider::new();
        let mut lock = provider.lock("k", Duration::from_secs(1));
        lock.release().unwrap();
        assert_eq!(provider.held_count(), 0);
    }
}
