// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client and simulator configuration loaded from environment variables.

use std::time::Duration;

use rand::Rng;

use ipcsim_core::config::{ConfigError, env_parse};
use ipcsim_core::permission::ROLE_VIEWER;
use ipcsim_server::{AuthError, TokenAuthority};

/// User id recorded in tokens the client signs itself.
pub const CLIENT_USER_ID: &str = "ipcsim-client";

/// Where session tokens come from.
#[derive(Clone)]
pub enum TokenSource {
    /// A pre-issued token, valid for one role only.
    Static(String),
    /// The server's signing secret; tokens are issued per role.
    Secret(String),
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenSource::Static(_) => f.write_str("Static(..)"),
            TokenSource::Secret(_) => f.write_str("Secret(..)"),
        }
    }
}

impl TokenSource {
    /// A token that authenticates `role`.
    pub fn token_for(&self, role: &str) -> Result<String, AuthError> {
        match self {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Secret(secret) => {
                TokenAuthority::new(secret).issue(role, CLIENT_USER_ID, None)
            }
        }
    }

    /// Whether tokens can be issued for any role.
    pub fn issues_any_role(&self) -> bool {
        matches!(self, TokenSource::Secret(_))
    }
}

/// Backoff between connection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Shortest delay before a reconnect.
    pub min_delay: Duration,
    /// Longest delay before a reconnect.
    pub max_delay: Duration,
    /// Consecutive failed reconnects tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Random delay in `[min_delay, max_delay]`.
    pub fn delay(&self) -> Duration {
        random_between(self.min_delay, self.max_delay)
    }
}

/// Connection settings of one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:3000/ws`.
    pub server_url: String,
    /// Role to authenticate as.
    pub role: String,
    /// Token source.
    pub token: TokenSource,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Capacity of the local pending queue.
    pub pending_queue_size: usize,
}

impl ClientConfig {
    /// Settings with default backoff and queue size.
    pub fn new(server_url: impl Into<String>, role: impl Into<String>, token: TokenSource) -> Self {
        Self {
            server_url: server_url.into(),
            role: role.into(),
            token,
            reconnect: ReconnectPolicy::default(),
            pending_queue_size: 100,
        }
    }

    /// Same settings for another role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Load configuration from environment variables.
    ///
    /// One of these is required:
    /// - `CLIENT_TOKEN`: pre-issued session token
    /// - `JWT_SECRET`: server secret, used to sign tokens locally
    ///
    /// Optional (with defaults):
    /// - `SERVER_URL`: WebSocket endpoint (default: ws://localhost:3000/ws)
    /// - `CLIENT_ROLE`: role to authenticate as (default: viewer)
    /// - `RECONNECT_DELAY_MIN`: shortest reconnect delay in ms (default: 1000)
    /// - `RECONNECT_DELAY_MAX`: longest reconnect delay in ms (default: 5000)
    /// - `RECONNECT_ATTEMPTS`: failed reconnects before giving up (default: 5)
    /// - `CLIENT_QUEUE_SIZE`: capacity of the local pending queue (default: 100)
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = match (non_empty("CLIENT_TOKEN"), non_empty("JWT_SECRET")) {
            (Some(token), _) => TokenSource::Static(token),
            (None, Some(secret)) => TokenSource::Secret(secret),
            (None, None) => return Err(ConfigError::Missing("JWT_SECRET")),
        };

        let server_url = std::env::var("SERVER_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "ws://localhost:3000/ws".to_string());
        if !server_url.starts_with("ws://") && !server_url.starts_with("wss://") {
            return Err(ConfigError::Invalid("SERVER_URL", "must be a ws:// or wss:// URL"));
        }

        let reconnect = ReconnectPolicy {
            min_delay: env_millis("RECONNECT_DELAY_MIN", 1000)?,
            max_delay: env_millis("RECONNECT_DELAY_MAX", 5000)?,
            max_attempts: env_parse("RECONNECT_ATTEMPTS", 5, "must be a non-negative integer")?,
        };
        if reconnect.min_delay > reconnect.max_delay {
            return Err(ConfigError::Invalid(
                "RECONNECT_DELAY_MIN",
                "must not exceed RECONNECT_DELAY_MAX",
            ));
        }

        let pending_queue_size =
            env_parse("CLIENT_QUEUE_SIZE", 100, "must be a positive integer")?;
        if pending_queue_size == 0 {
            return Err(ConfigError::Invalid("CLIENT_QUEUE_SIZE", "must be a positive integer"));
        }

        Ok(Self {
            server_url,
            role: std::env::var("CLIENT_ROLE").unwrap_or_else(|_| ROLE_VIEWER.to_string()),
            token,
            reconnect,
            pending_queue_size,
        })
    }
}

/// Traffic simulation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    /// Concurrent clients.
    pub clients: usize,
    /// Role of every client, or a random role per client when unset.
    pub role: Option<String>,
    /// How long to run; until shutdown when unset.
    pub duration: Option<Duration>,
    /// Shortest pause between two actions of a client.
    pub action_interval_min: Duration,
    /// Longest pause between two actions of a client.
    pub action_interval_max: Duration,
    /// How often aggregate statistics are logged.
    pub report_interval: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            clients: 10,
            role: None,
            duration: Some(Duration::from_secs(60)),
            action_interval_min: Duration::from_secs(2),
            action_interval_max: Duration::from_secs(10),
            report_interval: Duration::from_secs(10),
        }
    }
}

impl SimulationConfig {
    /// Load simulation settings from environment variables.
    ///
    /// - `NUM_CLIENTS`: concurrent clients (default: 10)
    /// - `SIMULATION_DURATION`: run time in ms (default: 60000)
    /// - `ACTION_INTERVAL_MIN`: shortest pause between actions in ms (default: 2000)
    /// - `ACTION_INTERVAL_MAX`: longest pause between actions in ms (default: 10000)
    /// - `STATS_INTERVAL`: statistics log period in ms (default: 10000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            clients: env_parse("NUM_CLIENTS", 10, "must be a positive integer")?,
            role: None,
            duration: Some(env_millis("SIMULATION_DURATION", 60_000)?),
            action_interval_min: env_millis("ACTION_INTERVAL_MIN", 2000)?,
            action_interval_max: env_millis("ACTION_INTERVAL_MAX", 10_000)?,
            report_interval: env_millis("STATS_INTERVAL", 10_000)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clients == 0 {
            return Err(ConfigError::Invalid("NUM_CLIENTS", "must be a positive integer"));
        }
        if self.action_interval_min > self.action_interval_max {
            return Err(ConfigError::Invalid(
                "ACTION_INTERVAL_MIN",
                "must not exceed ACTION_INTERVAL_MAX",
            ));
        }
        if self.report_interval.is_zero() {
            return Err(ConfigError::Invalid("STATS_INTERVAL", "must be greater than zero"));
        }
        Ok(())
    }

    /// Random pause before a client's next action.
    pub fn next_action_delay(&self) -> Duration {
        random_between(self.action_interval_min, self.action_interval_max)
    }
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_millis(key: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    env_parse(key, default_ms, "must be a duration in milliseconds").map(Duration::from_millis)
}

fn random_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}
