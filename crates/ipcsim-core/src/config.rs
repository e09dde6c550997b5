// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::permission::{PermissionTable, ROLE_ADMIN, ROLE_OPERATOR, ROLE_VIEWER};

/// Simulated process execution settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    /// Shortest simulated work duration.
    pub min_duration: Duration,
    /// Longest simulated work duration.
    pub max_duration: Duration,
    /// How often a running process checks for cancellation.
    pub check_interval: Duration,
    /// Transient failures retried before a process fails for good.
    pub max_retries: u32,
    /// Probability (0.0 - 1.0) that a simulated attempt fails.
    pub failure_rate: f64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            min_duration: Duration::from_millis(1000),
            max_duration: Duration::from_millis(10_000),
            check_interval: Duration::from_millis(100),
            max_retries: 3,
            failure_rate: 0.0,
        }
    }
}

/// Action queue settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Capacity of each owner's queue.
    pub max_size: usize,
    /// Entries older than this are pruned.
    pub max_age: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_age: Duration::from_secs(300),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Process execution settings.
    pub process: ProcessConfig,
    /// Queue settings.
    pub queue: QueueConfig,
    /// How often the cleanup worker runs.
    pub cleanup_interval: Duration,
    /// How long terminal processes stay in the registry.
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            process: ProcessConfig::default(),
            queue: QueueConfig::default(),
            cleanup_interval: Duration::from_secs(60),
            retention: Duration::from_secs(3600),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `PROCESS_MIN_DURATION`: shortest simulated work in ms (default: 1000)
    /// - `PROCESS_MAX_DURATION`: longest simulated work in ms (default: 10000)
    /// - `PROCESS_CHECK_INTERVAL`: cancellation poll interval in ms (default: 100)
    /// - `PROCESS_MAX_RETRIES`: retries after a transient failure (default: 3)
    /// - `PROCESS_FAILURE_RATE`: probability of a simulated failure (default: 0)
    /// - `QUEUE_MAX_SIZE`: capacity of each owner's queue (default: 100)
    /// - `QUEUE_MAX_AGE`: queued entries older than this many ms are pruned (default: 300000)
    /// - `CLEANUP_INTERVAL`: cleanup worker period in ms (default: 60000)
    /// - `METRICS_RETENTION`: retention of finished processes in ms (default: 3600000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            process: ProcessConfig {
                min_duration: env_millis("PROCESS_MIN_DURATION", 1000)?,
                max_duration: env_millis("PROCESS_MAX_DURATION", 10_000)?,
                check_interval: env_millis("PROCESS_CHECK_INTERVAL", 100)?,
                max_retries: env_parse(
                    "PROCESS_MAX_RETRIES",
                    3,
                    "must be a non-negative integer",
                )?,
                failure_rate: env_parse("PROCESS_FAILURE_RATE", 0.0, "must be a number")?,
            },
            queue: QueueConfig {
                max_size: env_parse("QUEUE_MAX_SIZE", 100, "must be a positive integer")?,
                max_age: env_millis("QUEUE_MAX_AGE", 300_000)?,
            },
            cleanup_interval: env_millis("CLEANUP_INTERVAL", 60_000)?,
            retention: env_millis("METRICS_RETENTION", 3_600_000)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.process.min_duration > self.process.max_duration {
            return Err(ConfigError::Invalid(
                "PROCESS_MIN_DURATION",
                "must not exceed PROCESS_MAX_DURATION",
            ));
        }
        if self.process.check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "PROCESS_CHECK_INTERVAL",
                "must be greater than zero",
            ));
        }
        if !(0.0..=1.0).contains(&self.process.failure_rate) {
            return Err(ConfigError::Invalid(
                "PROCESS_FAILURE_RATE",
                "must be between 0 and 1",
            ));
        }
        if self.queue.max_size == 0 {
            return Err(ConfigError::Invalid(
                "QUEUE_MAX_SIZE",
                "must be a positive integer",
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "CLEANUP_INTERVAL",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Load the stock role table with concurrency caps from the environment.
///
/// - `ADMIN_MAX_PROCESSES` (default: 10)
/// - `OPERATOR_MAX_PROCESSES` (default: 5)
/// - `VIEWER_MAX_PROCESSES` (default: 2)
pub fn permissions_from_env() -> Result<PermissionTable, ConfigError> {
    Ok(PermissionTable::defaults()
        .with_max_concurrent(
            ROLE_ADMIN,
            env_parse("ADMIN_MAX_PROCESSES", 10, "must be a non-negative integer")?,
        )
        .with_max_concurrent(
            ROLE_OPERATOR,
            env_parse("OPERATOR_MAX_PROCESSES", 5, "must be a non-negative integer")?,
        )
        .with_max_concurrent(
            ROLE_VIEWER,
            env_parse("VIEWER_MAX_PROCESSES", 2, "must be a non-negative integer")?,
        ))
}

/// Parse `key` from the environment, or return `default` when it is unset.
///
/// A value that does not parse yields [`ConfigError::Invalid`] with `hint`.
pub fn env_parse<T: std::str::FromStr>(
    key: &'static str,
    default: T,
    hint: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key, hint)),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    env_parse(key, default_ms, "must be a duration in milliseconds").map(Duration::from_millis)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

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

    const KEYS: &[&str] = &[
        "PROCESS_MIN_DURATION",
        "PROCESS_MAX_DURATION",
        "PROCESS_CHECK_INTERVAL",
        "PROCESS_MAX_RETRIES",
        "PROCESS_FAILURE_RATE",
        "QUEUE_MAX_SIZE",
        "QUEUE_MAX_AGE",
        "CLEANUP_INTERVAL",
        "METRICS_RETENTION",
        "ADMIN_MAX_PROCESSES",
        "OPERATOR_MAX_PROCESSES",
        "VIEWER_MAX_PROCESSES",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in KEYS {
                guard.remove(key);
            }
            guard
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

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = SchedulerConfig::from_env().unwrap();
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.process.max_retries, 3);
        assert_eq!(config.process.check_interval, Duration::from_millis(100));
        assert_eq!(config.queue.max_size, 100);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("PROCESS_MIN_DURATION", "50");
        guard.set("PROCESS_MAX_DURATION", "200");
        guard.set("PROCESS_CHECK_INTERVAL", "10");
        guard.set("PROCESS_MAX_RETRIES", "1");
        guard.set("PROCESS_FAILURE_RATE", "0.25");
        guard.set("QUEUE_MAX_SIZE", "5");
        guard.set("QUEUE_MAX_AGE", "1000");
        guard.set("CLEANUP_INTERVAL", "500");
        guard.set("METRICS_RETENTION", "2000");

        let config = SchedulerConfig::from_env().unwrap();
        assert_eq!(config.process.min_duration, Duration::from_millis(50));
        assert_eq!(config.process.max_duration, Duration::from_millis(200));
        assert_eq!(config.process.check_interval, Duration::from_millis(10));
        assert_eq!(config.process.max_retries, 1);
        assert_eq!(config.process.failure_rate, 0.25);
        assert_eq!(config.queue.max_size, 5);
        assert_eq!(config.queue.max_age, Duration::from_secs(1));
        assert_eq!(config.cleanup_interval, Duration::from_millis(500));
        assert_eq!(config.retention, Duration::from_secs(2));
    }

    #[test]
    fn test_config_invalid_number() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("PROCESS_MAX_RETRIES", "-1");
        let err = SchedulerConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("PROCESS_MAX_RETRIES", _)));
    }

    #[test]
    fn test_config_min_above_max_duration() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("PROCESS_MIN_DURATION", "5000");
        guard.set("PROCESS_MAX_DURATION", "1000");
        let err = SchedulerConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("PROCESS_MIN_DURATION", _)));
    }

    #[test]
    fn test_config_rejects_zero_check_interval_and_bad_rate() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("PROCESS_CHECK_INTERVAL", "0");
        assert!(matches!(
            SchedulerConfig::from_env().unwrap_err(),
            ConfigError::Invalid("PROCESS_CHECK_INTERVAL", _)
        ));

        guard.set("PROCESS_CHECK_INTERVAL", "100");
        guard.set("PROCESS_FAILURE_RATE", "1.5");
        assert!(matches!(
            SchedulerConfig::from_env().unwrap_err(),
            ConfigError::Invalid("PROCESS_FAILURE_RATE", _)
        ));
    }

    #[test]
    fn test_permissions_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("OPERATOR_MAX_PROCESSES", "1");
        let table = permissions_from_env().unwrap();
        assert_eq!(table.get(ROLE_OPERATOR).unwrap().max_concurrent_processes, 1);
        assert_eq!(table.get(ROLE_ADMIN).unwrap().max_concurrent_processes, 10);
        assert_eq!(table.get(ROLE_VIEWER).unwrap().max_concurrent_processes, 2);

        guard.set("VIEWER_MAX_PROCESSES", "two");
        assert!(matches!(
            permissions_from_env().unwrap_err(),
            ConfigError::Invalid("VIEWER_MAX_PROCESSES", _)
        ));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
