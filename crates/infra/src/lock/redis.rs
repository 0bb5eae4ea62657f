//! Redis-backed distributed locks.
//!
//! Acquisition is a single `SET name token NX PX ttl`. Release runs a small Lua
//! script that deletes the key only if it still carries our token, so a holder whose
//! lease already expired can never free someone else's lock.

use std::time::Duration;

use redis::Script;
use uuid::Uuid;

use super::{Lock, LockError, LockProvider};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisLockProvider {
    client: redis::Client,
}

impl RedisLockProvider {
    /// Create a provider for the given Redis URL (e.g. `redis://127.0.0.1/`).
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Backend(format!("failed to create redis client: {e}")))?;
        Ok(Self { client })
    }
}

impl LockProvider for RedisLockProvider {
    type Lock = RedisLock;

    fn lock(&self, name: &str, ttl: Duration) -> RedisLock {
        RedisLock {
            client: self.client.clone(),
            name: name.to_string(),
            ttl,
            token: None,
        }
    }
}

#[derive(Debug)]
pub struct RedisLock {
    client: redis::Client,
    name: String,
    ttl: Duration,
    token: Option<String>,
}

impl RedisLock {
    fn connection(&self) -> Result<redis::Connection, LockError> {
        self.client
            .get_connection()
            .map_err(|e| LockError::Backend(format!("failed to get redis connection: {e}")))
    }
}

impl Lock for RedisLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&mut self) -> Result<bool, LockError> {
        let mut conn = self.connection()?;
        let token = self
            .token
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.name)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query(&mut conn)
            .map_err(|e| LockError::Backend(format!("SET NX failed for {}: {e}", self.name)))?;

        let acquired = reply.is_some();
        if acquired {
            self.token = Some(token);
        }
        Ok(acquired)
    }

    fn release(&mut self) -> Result<(), LockError> {
        let Some(token) = self.token.take() else {
            return Ok(());
        };

        let mut conn = self.connection()?;
        let _deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(&self.name)
            .arg(token)
            .invoke(&mut conn)
            .map_err(|e| LockError::Backend(format!("release failed for {}: {e}", self.name)))?;
        Ok(())
    }
}
