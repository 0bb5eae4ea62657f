//! Broker configuration.

use std::time::Duration;

use tracing::warn;

pub const ENV_COMMIT_IMMEDIATELY: &str = "EVENTLINE_COMMIT_IMMEDIATELY";
pub const ENV_LOCK_TTL_SECS: &str = "EVENTLINE_LOCK_TTL_SECS";
pub const ENV_LOCK_PREFIX: &str = "EVENTLINE_LOCK_PREFIX";

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);
const DEFAULT_LOCK_PREFIX: &str = "state_lock_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Commit after every `fire` instead of waiting for an explicit `commit`.
    pub commit_immediately: bool,
    /// Lease length of each per-state commit lock.
    pub lock_ttl: Duration,
    /// Prepended to a state key to form its lock name.
    pub lock_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            commit_immediately: false,
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
        }
    }
}

impl BrokerConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`. Missing or unparsable values keep their
    /// defaults; unparsable ones are logged.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_COMMIT_IMMEDIATELY) {
            match parse_bool(&raw) {
                Some(value) => config.commit_immediately = value,
                None => warn!(var = ENV_COMMIT_IMMEDIATELY, value = %raw, "ignoring invalid boolean"),
            }
        }

        if let Some(raw) = lookup(ENV_LOCK_TTL_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.lock_ttl = Duration::from_secs(secs),
                _ => warn!(var = ENV_LOCK_TTL_SECS, value = %raw, "ignoring invalid lock ttl"),
            }
        }

        if let Some(raw) = lookup(ENV_LOCK_PREFIX) {
            config.lock_prefix = raw;
        }

        config
    }

    pub fn with_commit_immediately(mut self, commit_immediately: bool) -> Self {
        self.commit_immediately = commit_immediately;
        self
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn with_lock_prefix(mut self, lock_prefix: impl Into<String>) -> Self {
        self.lock_prefix = lock_prefix.into();
        self
    }

    /// Lock name guarding `key` during a commit.
    pub fn lock_name(&self, key: impl core::fmt::Display) -> String {
        format!("{}{key}", self.lock_prefix)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        assert_eq!(BrokerConfig::from_lookup(lookup(&[])), BrokerConfig::default());
        assert_eq!(BrokerConfig::default().lock_ttl, Duration::from_secs(60));
        assert_eq!(BrokerConfig::default().lock_name("A1"), "state_lock_A1");
    }

    #[test]
    fn values_are_read_from_lookup() {
        let config = BrokerConfig::from_lookup(lookup(&[
            (ENV_COMMIT_IMMEDIATELY, "TRUE"),
            (ENV_LOCK_TTL_SECS, " 15 "),
            (ENV_LOCK_PREFIX, "ledger:"),
        ]));

        assert!(config.commit_immediately);
        assert_eq!(config.lock_ttl, Duration::from_secs(15));
        assert_eq!(config.lock_name("A1"), "ledger:A1");
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = BrokerConfig::from_lookup(lookup(&[
            (ENV_COMMIT_IMMEDIATELY, "sometimes"),
            (ENV_LOCK_TTL_SECS, "0"),
        ]));

        assert!(!config.commit_immediately);
        assert_eq!(config.lock_ttl, Duration::from_secs(60));
    }
}
