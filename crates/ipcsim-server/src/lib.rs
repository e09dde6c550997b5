// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ipcsim Server - WebSocket and HTTP front end
//!
//! Exposes an [`ipcsim_core::Dispatcher`] to clients over WebSocket and
//! reports health and metrics over HTTP.
//!
//! # Endpoints
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /` | Banner |
//! | `GET /health` | Status, uptime, connection and process counts |
//! | `GET /status` | Running processes by type, connected clients |
//! | `GET /status/detailed` | Running processes and queue statistics |
//! | `GET /metrics` | Prometheus text exposition, see [`metrics`] |
//! | `GET /ws` | WebSocket protocol, see [`protocol`] |
//!
//! # WebSocket Session
//!
//! ```text
//! client                       server
//!   │ auth {role, token}         │
//!   │───────────────────────────►│ verify HS256 token, role must match
//!   │◄───────────────────────────│ auth_response {status, permissions}
//!   │ accion {...}               │
//!   │───────────────────────────►│ rate limit, then Dispatcher::submit
//!   │            ...             │ (starts now or waits in queue)
//!   │◄───────────────────────────│ accion_respuesta once the process ends
//!   │ interrumpir {processId}    │
//!   │───────────────────────────►│ owner or admin only
//!   │◄───────────────────────────│ interrupcion_respuesta
//!   │ close                      │ interrupt running, drop queued
//! ```
//!
//! # Configuration
//!
//! See [`config::Config::from_env`].

#![deny(missing_docs)]

use std::future::Future;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use ipcsim_core::runtime::SchedulerRuntime;

/// Session token issuing and verification.
pub mod auth;

/// Server configuration.
pub mod config;

/// Per-connection session state.
pub mod connection;

/// HTTP-facing error type.
pub mod error;

/// Prometheus metrics fed by scheduler events.
pub mod metrics;

/// WebSocket message framing.
pub mod protocol;

/// Per-connection rate limiting.
pub mod rate_limit;

/// HTTP routes and the WebSocket endpoint.
pub mod routes;

pub use auth::{AuthError, Claims, Identity, TokenAuthority};
pub use config::Config;
pub use connection::{Connections, Session};
pub use error::Error;
pub use metrics::{MetricsCollector, MetricsError};
pub use protocol::{ClientMessage, ServerMessage, Status};
pub use routes::{AppState, router};

/// Run the server on `listener` until `shutdown` resolves.
///
/// Starts the scheduler runtime and the metrics collector, serves HTTP and
/// WebSocket traffic, then shuts everything down in reverse order.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let runtime = SchedulerRuntime::builder()
        .config(config.scheduler.clone())
        .permissions(config.permissions.clone())
        .build()?
        .start()
        .await?;
    let dispatcher = runtime.dispatcher().clone();

    let metrics = MetricsCollector::new()?;
    let metrics_shutdown = metrics.shutdown_handle();
    let metrics_handle = tokio::spawn(metrics.clone().run(dispatcher.subscribe()));

    let state = AppState::new(config, dispatcher, metrics);
    let addr = listener.local_addr()?;
    info!(addr = %addr, "ipcsim server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped");
    metrics_shutdown.notify_one();
    let _ = metrics_handle.await;
    runtime.shutdown().await
}
