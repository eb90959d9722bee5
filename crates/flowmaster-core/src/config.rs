// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration loading from environment variables.

use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of event-bus fire-worker shards.
    pub shard_count: usize,
    /// Fixed delay between shard ticks.
    pub poll_interval: Duration,
    /// Backoff applied by a shard after a transient infrastructure
    /// failure, to avoid hot-looping against a down database.
    pub transient_backoff: Duration,
    /// Maximum dispatch attempts (send failures and recalls included)
    /// before a task is treated as permanently failed.
    pub max_dispatch_attempts: u32,
    /// Address of this master process, recorded on owned instances.
    pub host: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_count: 4,
            poll_interval: Duration::from_millis(100),
            transient_backoff: Duration::from_secs(5),
            max_dispatch_attempts: 3,
            host: "127.0.0.1:5678".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional (with defaults):
    /// - `FLOWMASTER_SHARD_COUNT`: fire-worker shard count (default: 4)
    /// - `FLOWMASTER_POLL_INTERVAL_MS`: shard tick interval (default: 100)
    /// - `FLOWMASTER_TRANSIENT_BACKOFF_MS`: backoff after a transient
    ///   failure (default: 5000)
    /// - `FLOWMASTER_MAX_DISPATCH_ATTEMPTS`: dispatch attempts before a
    ///   task fails hard (default: 3)
    /// - `FLOWMASTER_HOST`: address of this master (default: 127.0.0.1:5678)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let shard_count: usize = parse_var(
            "FLOWMASTER_SHARD_COUNT",
            defaults.shard_count,
            "must be a positive integer",
        )?;
        if shard_count == 0 {
            return Err(ConfigError::Invalid(
                "FLOWMASTER_SHARD_COUNT",
                "must be at least 1",
            ));
        }

        let poll_interval_ms: u64 = parse_var(
            "FLOWMASTER_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
            "must be a duration in milliseconds",
        )?;

        let transient_backoff_ms: u64 = parse_var(
            "FLOWMASTER_TRANSIENT_BACKOFF_MS",
            defaults.transient_backoff.as_millis() as u64,
            "must be a duration in milliseconds",
        )?;

        let max_dispatch_attempts: u32 = parse_var(
            "FLOWMASTER_MAX_DISPATCH_ATTEMPTS",
            defaults.max_dispatch_attempts,
            "must be a positive integer",
        )?;

        let host = std::env::var("FLOWMASTER_HOST").unwrap_or(defaults.host);

        Ok(Self {
            shard_count,
            poll_interval: Duration::from_millis(poll_interval_ms),
            transient_backoff: Duration::from_millis(transient_backoff_ms),
            max_dispatch_attempts,
            host,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: T,
    message: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(name, message)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn clear_all(guard: &mut EnvGuard) {
        guard.remove("FLOWMASTER_SHARD_COUNT");
        guard.remove("FLOWMASTER_POLL_INTERVAL_MS");
        guard.remove("FLOWMASTER_TRANSIENT_BACKOFF_MS");
        guard.remove("FLOWMASTER_MAX_DISPATCH_ATTEMPTS");
        guard.remove("FLOWMASTER_HOST");
    }

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.shard_count, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.transient_backoff, Duration::from_secs(5));
        assert_eq!(config.max_dispatch_attempts, 3);
        assert_eq!(config.host, "127.0.0.1:5678");
    }

    #[test]
    fn test_config_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        guard.set("FLOWMASTER_SHARD_COUNT", "8");
        guard.set("FLOWMASTER_POLL_INTERVAL_MS", "50");
        guard.set("FLOWMASTER_TRANSIENT_BACKOFF_MS", "1000");
        guard.set("FLOWMASTER_MAX_DISPATCH_ATTEMPTS", "5");
        guard.set("FLOWMASTER_HOST", "10.0.0.2:5678");

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.shard_count, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.transient_backoff, Duration::from_secs(1));
        assert_eq!(config.max_dispatch_attempts, 5);
        assert_eq!(config.host, "10.0.0.2:5678");
    }

    #[test]
    fn test_config_invalid_shard_count() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        guard.set("FLOWMASTER_SHARD_COUNT", "not_a_number");
        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("FLOWMASTER_SHARD_COUNT", _)));
    }

    #[test]
    fn test_config_zero_shard_count_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        guard.set("FLOWMASTER_SHARD_COUNT", "0");
        let err = EngineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn test_config_invalid_poll_interval() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        guard.set("FLOWMASTER_POLL_INTERVAL_MS", "-10");
        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("FLOWMASTER_POLL_INTERVAL_MS", _)
        ));
    }
}
