// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for ipcsim-server integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use ipcsim_core::{Dispatcher, PermissionTable, SchedulerConfig, SimulatedWorkload};
use ipcsim_server::{
    AppState, Config, Connections, MetricsCollector, ServerMessage, Session, TokenAuthority,
};
use ipcsim_server::rate_limit::RateLimiter;

pub const SECRET: &str = "integration-secret";

/// Server settings for tests.
pub fn config(max_connections: usize, rate_limit_max: u32) -> Config {
    Config {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        jwt_secret: SECRET.to_string(),
        max_connections,
        rate_limit_window: Duration::from_secs(60),
        rate_limit_max,
        connection_warning_percent: 90,
        max_active_processes: 100,
        scheduler: SchedulerConfig::default(),
        permissions: PermissionTable::defaults(),
    }
}

/// Dispatcher whose processes take exactly `work`.
pub fn dispatcher(work: Duration) -> Dispatcher {
    let mut scheduler = SchedulerConfig::default();
    scheduler.process.min_duration = work;
    scheduler.process.max_duration = work;
    Dispatcher::new(
        PermissionTable::defaults(),
        Arc::new(SimulatedWorkload::new(work, work)),
        scheduler,
    )
}

pub fn token(role: &str) -> String {
    TokenAuthority::new(SECRET)
        .issue(role, "tester", None)
        .unwrap()
}

/// A session wired to `dispatcher`, plus the receiving end of its frames.
pub fn session(
    dispatcher: &Dispatcher,
    connections: &Arc<Connections>,
    rate_limit_max: u32,
) -> (Session, mpsc::UnboundedReceiver<ServerMessage>) {
    let id = Uuid::new_v4();
    assert!(connections.try_register(id));
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::new(
        id,
        dispatcher.clone(),
        TokenAuthority::new(SECRET),
        connections.clone(),
        RateLimiter::new(Duration::from_secs(60), rate_limit_max),
        tx,
    );
    (session, rx)
}

/// Authenticate `session` as `role` and consume the response.
pub async fn login(
    session: &mut Session,
    rx: &mut mpsc::UnboundedReceiver<ServerMessage>,
    role: &str,
) {
    session
        .handle_text(&frame("auth", json!({"role": role, "token": token(role)})))
        .await;
    let reply = rx.recv().await.unwrap();
    assert!(
        matches!(
            reply,
            ServerMessage::AuthResponse {
                status: ipcsim_server::Status::Success,
                ..
            }
        ),
        "login failed: {reply:?}"
    );
}

pub fn frame(event: &str, data: Value) -> String {
    json!({ "event": event, "data": data }).to_string()
}

pub fn accion(action_type: &str, process_type: &str) -> String {
    frame(
        "accion",
        json!({"type": action_type, "processType": process_type, "priority": 1, "data": {"n": 1}}),
    )
}

/// Application state over `dispatcher`.
pub fn app_state(config: Config, dispatcher: Dispatcher) -> AppState {
    AppState::new(config, dispatcher, MetricsCollector::new().unwrap())
}
