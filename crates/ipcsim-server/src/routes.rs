// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP routes and the WebSocket endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ipcsim_core::{Dispatcher, Process, ProcessType, QueueStats};

use crate::auth::TokenAuthority;
use crate::config::Config;
use crate::connection::{Connections, Session};
use crate::error::Error;
use crate::metrics::{self as prom, MetricsCollector};
use crate::protocol::ServerMessage;
use crate::rate_limit::RateLimiter;

/// Text served on `/`.
pub const BANNER: &str = "¡Bienvenido a la Simulación de IPC optimizada con RLS!";

/// Server state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Scheduler front door.
    pub dispatcher: Dispatcher,
    /// Session token verifier.
    pub authority: TokenAuthority,
    /// Open WebSocket connections.
    pub connections: Arc<Connections>,
    /// Prometheus registry fed by scheduler events.
    pub metrics: MetricsCollector,
    /// Server settings.
    pub config: Arc<Config>,
    /// Process start time, for uptime.
    pub started_at: Instant,
}

impl AppState {
    /// Assemble the state from its parts.
    pub fn new(config: Config, dispatcher: Dispatcher, metrics: MetricsCollector) -> Self {
        Self {
            authority: TokenAuthority::new(&config.jwt_secret),
            connections: Arc::new(Connections::new(config.max_connections)),
            dispatcher,
            metrics,
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/status/detailed", get(status_detailed))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn root() -> &'static str {
    BANNER
}

/// Body of `/health`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `healthy` or `degraded`.
    pub status: &'static str,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Crate version.
    pub version: &'static str,
    /// Seconds since start.
    pub uptime: f64,
    /// Open connections.
    pub connections: ConnectionCounts,
    /// Process counts.
    pub processes: ProcessCounts,
    /// Reasons for a `degraded` status.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

/// Connection section of `/health`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCounts {
    /// Open connections.
    pub total: usize,
    /// Open connections per role.
    pub by_role: BTreeMap<String, usize>,
}

/// Process section of `/health`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessCounts {
    /// Running processes.
    pub active: usize,
    /// Retained processes.
    pub total: usize,
    /// Retained processes per state.
    pub by_state: BTreeMap<&'static str, usize>,
    /// Running processes per type.
    pub by_type: BTreeMap<&'static str, usize>,
    /// Queued actions.
    pub queued: usize,
}

fn active_by_type(active: &[Process]) -> BTreeMap<&'static str, usize> {
    ProcessType::ALL
        .iter()
        .map(|t| {
            (
                t.as_str(),
                active.iter().filter(|p| p.process_type == *t).count(),
            )
        })
        .collect()
}

async fn health(State(state): State<AppState>) -> Response {
    let registry = state.dispatcher.registry();
    let active = registry.active_processes();
    let connections = state.connections.len();

    let mut issues = Vec::new();
    let max_connections = state.connections.max().max(1);
    let connection_percent = connections as f64 * 100.0 / max_connections as f64;
    if connection_percent > f64::from(state.config.connection_warning_percent) {
        issues.push(format!("High connection count: {connections}"));
    }
    if active.len() > state.config.max_active_processes {
        issues.push(format!("High active process count: {}", active.len()));
    }

    let body = HealthResponse {
        status: if issues.is_empty() { "healthy" } else { "degraded" },
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs_f64(),
        connections: ConnectionCounts {
            total: connections,
            by_role: state.connections.by_role(),
        },
        processes: ProcessCounts {
            active: active.len(),
            total: registry.len(),
            by_state: registry.state_counts(),
            by_type: active_by_type(&active),
            queued: state.dispatcher.queued_len().await,
        },
        issues,
    };

    let code = if body.issues.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    (code, Json(body)).into_response()
}

/// Body of `/status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Running processes.
    pub active_processes: usize,
    /// Running processes per type.
    pub process_types: BTreeMap<&'static str, usize>,
    /// Open connections.
    pub connected_clients: usize,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let active = state.dispatcher.registry().active_processes();
    Json(StatusResponse {
        active_processes: active.len(),
        process_types: active_by_type(&active),
        connected_clients: state.connections.len(),
    })
}

/// Body of `/status/detailed`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedStatusResponse {
    /// Crate version.
    pub version: &'static str,
    /// Seconds since start.
    pub uptime: f64,
    /// Running processes.
    pub active: Vec<Process>,
    /// Aggregated queue statistics.
    pub queue: QueueStats,
    /// Retained processes.
    pub total_processed: usize,
}

async fn status_detailed(State(state): State<AppState>) -> Json<DetailedStatusResponse> {
    let registry = state.dispatcher.registry();
    Json(DetailedStatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs_f64(),
        active: registry.active_processes(),
        queue: state.dispatcher.queue_stats().await,
        total_processed: registry.len(),
    })
}

async fn metrics(State(state): State<AppState>) -> Result<Response, Error> {
    state.metrics.set_connections(&state.connections.by_role());
    let body = state.metrics.encode_text()?;
    Ok(([(header::CONTENT_TYPE, prom::CONTENT_TYPE)], body).into_response())
}

async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, Error> {
    let id = Uuid::new_v4();
    if !state.connections.try_register(id) {
        warn!(max = state.connections.max(), "Connection rejected: limit reached");
        return Err(Error::TooManyConnections);
    }

    let connections = state.connections.clone();
    Ok(ws
        .on_failed_upgrade(move |e| {
            warn!(connection_id = %id, error = %e, "WebSocket upgrade failed");
            connections.remove(id);
        })
        .on_upgrade(move |socket| handle_socket(socket, state, id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, id: Uuid) {
    info!(connection_id = %id, "Client connected");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(Message::Text(message.to_json().into())).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(
        id,
        state.dispatcher.clone(),
        state.authority.clone(),
        state.connections.clone(),
        RateLimiter::new(state.config.rate_limit_window, state.config.rate_limit_max),
        tx,
    );

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => session.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    session.close().await;
    writer.abort();
}
