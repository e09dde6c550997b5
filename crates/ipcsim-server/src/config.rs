// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use ipcsim_core::config::{ConfigError, SchedulerConfig, env_parse, permissions_from_env};
use ipcsim_core::PermissionTable;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket listen address.
    pub bind_addr: SocketAddr,
    /// HS256 signing secret for session tokens.
    pub jwt_secret: String,
    /// Open WebSocket connections allowed at once.
    pub max_connections: usize,
    /// Length of a rate limit window.
    pub rate_limit_window: Duration,
    /// Messages allowed per connection and window.
    pub rate_limit_max: u32,
    /// `/health` reports `degraded` above this share of `max_connections`.
    pub connection_warning_percent: u8,
    /// `/health` reports `degraded` above this many running processes.
    pub max_active_processes: usize,
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Role table.
    pub permissions: PermissionTable,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `JWT_SECRET`: secret used to sign and verify session tokens
    ///
    /// Optional (with defaults):
    /// - `PORT`: listen port (default: 3000)
    /// - `MAX_CONNECTIONS`: concurrent WebSocket connections (default: 100)
    /// - `RATE_LIMIT_WINDOW`: rate limit window in ms (default: 60000)
    /// - `RATE_LIMIT_MAX`: messages per window and connection (default: 100)
    /// - `CONNECTION_WARNING`: connection usage percent that degrades health (default: 90)
    /// - `MAX_ACTIVE_PROCESSES`: running processes that degrade health (default: 100)
    ///
    /// Scheduler and role settings are read by
    /// [`SchedulerConfig::from_env`] and [`permissions_from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = std::env::var("JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let port: u16 = env_parse("PORT", 3000, "must be a valid port number")?;
        let max_connections = env_parse("MAX_CONNECTIONS", 100, "must be a positive integer")?;
        let rate_limit_window_ms: u64 =
            env_parse("RATE_LIMIT_WINDOW", 60_000, "must be a duration in milliseconds")?;
        let rate_limit_max = env_parse("RATE_LIMIT_MAX", 100, "must be a positive integer")?;
        let connection_warning_percent: u8 =
            env_parse("CONNECTION_WARNING", 90, "must be a percentage")?;
        let max_active_processes =
            env_parse("MAX_ACTIVE_PROCESSES", 100, "must be a positive integer")?;

        if connection_warning_percent > 100 {
            return Err(ConfigError::Invalid("CONNECTION_WARNING", "must be a percentage"));
        }
        if rate_limit_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "RATE_LIMIT_WINDOW",
                "must be greater than zero",
            ));
        }

        Ok(Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            jwt_secret,
            max_connections,
            rate_limit_window: Duration::from_millis(rate_limit_window_ms),
            rate_limit_max,
            connection_warning_percent,
            max_active_processes,
            scheduler: SchedulerConfig::from_env()?,
            permissions: permissions_from_env()?,
        })
    }
}
