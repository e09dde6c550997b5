// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-connection session state.
//!
//! A [`Session`] is independent of the socket: it consumes decoded text
//! frames and pushes [`ServerMessage`]s into an unbounded channel that the
//! socket writer drains. `accion` answers are sent when the process ends, so
//! they arrive asynchronously and possibly out of order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ipcsim_core::{
    Action, Denial, Dispatcher, InterruptOutcome, ProcessOutcome, ReleaseSummary,
};

use crate::auth::{Identity, TokenAuthority};
use crate::protocol::{AuthRequest, ClientMessage, ServerMessage, Status};
use crate::rate_limit::RateLimiter;

/// Client-visible messages.
pub mod messages {
    /// `accion`/`interrumpir` before a successful `auth`.
    pub const NOT_AUTHENTICATED: &str = "No autenticado";
    /// Message budget of the window is spent.
    pub const RATE_LIMITED: &str = "Rate limit excedido";
    /// The role may not run the action.
    pub const PERMISSION_DENIED: &str = "Permiso denegado";
    /// Unknown or already finished process.
    pub const PROCESS_NOT_FOUND: &str = "Proceso no encontrado";
    /// Interrupting someone else's process without the admin role.
    pub const INTERRUPT_FORBIDDEN: &str = "No tienes permiso para interrumpir este proceso";
    /// Interrupt accepted.
    pub const INTERRUPTED: &str = "Proceso interrumpido correctamente";
    /// Process completed.
    pub const COMPLETED: &str = "Proceso completado correctamente";
    /// Process observed an interrupt.
    pub const PROCESS_INTERRUPTED: &str = "Proceso interrumpido";
}

/// Bookkeeping for one open connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    /// Role once authenticated.
    pub role: Option<String>,
    /// When the socket was accepted.
    pub connected_at: DateTime<Utc>,
}

/// Open connections, capped at a maximum.
#[derive(Debug)]
pub struct Connections {
    entries: DashMap<Uuid, ConnectionInfo>,
    count: AtomicUsize,
    max: usize,
}

impl Connections {
    /// Allow at most `max` connections.
    pub fn new(max: usize) -> Self {
        Self {
            entries: DashMap::new(),
            count: AtomicUsize::new(0),
            max,
        }
    }

    /// Reserve a slot for `id`. Returns `false` at the limit.
    pub fn try_register(&self, id: Uuid) -> bool {
        let reserved = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok();
        if reserved {
            self.entries.insert(
                id,
                ConnectionInfo {
                    role: None,
                    connected_at: Utc::now(),
                },
            );
        }
        reserved
    }

    /// Record the authenticated role of `id`.
    pub fn set_role(&self, id: Uuid, role: &str) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.role = Some(role.to_string());
        }
    }

    /// Release the slot of `id`.
    pub fn remove(&self, id: Uuid) {
        if self.entries.remove(&id).is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Open connections.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether no connection is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connection limit.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Open connections per role; unauthenticated ones are counted as `anonymous`.
    pub fn by_role(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.iter() {
            let role = entry.role.clone().unwrap_or_else(|| "anonymous".to_string());
            *counts.entry(role).or_insert(0) += 1;
        }
        counts
    }
}

/// Protocol state of one WebSocket connection.
pub struct Session {
    id: Uuid,
    owner: String,
    dispatcher: Dispatcher,
    authority: TokenAuthority,
    connections: Arc<Connections>,
    limiter: RateLimiter,
    identity: Option<Identity>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create the session for connection `id`. Its owner id is `id`.
    pub fn new(
        id: Uuid,
        dispatcher: Dispatcher,
        authority: TokenAuthority,
        connections: Arc<Connections>,
        limiter: RateLimiter,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            id,
            owner: id.to_string(),
            dispatcher,
            authority,
            connections,
            limiter,
            identity: None,
            outbound,
        }
    }

    /// Connection id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Owner id used for scheduling.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Authenticated identity, if any.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Handle one text frame.
    pub async fn handle_text(&mut self, text: &str) {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                debug!(connection_id = %self.id, error = %e, "Undecodable frame");
                self.send(e.to_response());
            }
        }
    }

    /// Handle a decoded message.
    pub async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Auth(request) => self.on_auth(request).await,
            ClientMessage::Accion(action) => self.on_accion(action).await,
            ClientMessage::Interrumpir { process_id } => self.on_interrumpir(&process_id).await,
        }
    }

    async fn on_auth(&mut self, request: AuthRequest) {
        let gate = self.dispatcher.permissions().await;
        match self
            .authority
            .authenticate(&request.role, &request.token, gate.table())
        {
            Ok(identity) => {
                info!(
                    connection_id = %self.id,
                    role = %identity.role,
                    user_id = %identity.user_id,
                    "Client authenticated"
                );
                self.connections.set_role(self.id, &identity.role);
                self.send(ServerMessage::auth_success(identity.permission.clone()));
                self.identity = Some(identity);
            }
            Err(e) => {
                warn!(
                    connection_id = %self.id,
                    role = %request.role,
                    error = %e,
                    "Authentication failed"
                );
                self.send(ServerMessage::auth_error(e.to_string()));
            }
        }
    }

    async fn on_accion(&mut self, action: Action) {
        let Some(role) = self.identity.as_ref().map(|i| i.role.clone()) else {
            self.send(ServerMessage::accion_error(messages::NOT_AUTHENTICATED));
            return;
        };
        if !self.limiter.check() {
            warn!(connection_id = %self.id, "Rate limit exceeded");
            self.send(ServerMessage::accion_error(messages::RATE_LIMITED));
            return;
        }

        match self.dispatcher.submit(&self.owner, &role, action).await {
            Ok(submission) => {
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let outcome = submission.into_completion().await;
                    let _ = outbound.send(outcome_message(outcome));
                });
            }
            Err(denial) => self.send(ServerMessage::accion_error(denial_message(&denial))),
        }
    }

    async fn on_interrumpir(&mut self, process_id: &str) {
        let Some(role) = self.identity.as_ref().map(|i| i.role.clone()) else {
            self.send(ServerMessage::interrupcion(
                Status::Error,
                messages::NOT_AUTHENTICATED,
            ));
            return;
        };

        let reply = match self.dispatcher.interrupt(&self.owner, &role, process_id).await {
            InterruptOutcome::Interrupted => {
                ServerMessage::interrupcion(Status::Success, messages::INTERRUPTED)
            }
            InterruptOutcome::NotFound => {
                ServerMessage::interrupcion(Status::Error, messages::PROCESS_NOT_FOUND)
            }
            InterruptOutcome::Forbidden => {
                ServerMessage::interrupcion(Status::Error, messages::INTERRUPT_FORBIDDEN)
            }
        };
        self.send(reply);
    }

    /// Tear the session down: interrupt the owner's processes, drop its queue
    /// and free the connection slot.
    pub async fn close(self) -> ReleaseSummary {
        let summary = self.dispatcher.release_owner(&self.owner).await;
        self.connections.remove(self.id);
        info!(
            connection_id = %self.id,
            interrupted = summary.interrupted,
            dropped = summary.dropped,
            "Client disconnected"
        );
        summary
    }

    fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            debug!(connection_id = %self.id, "Outbound channel closed");
        }
    }
}

fn denial_message(denial: &Denial) -> String {
    match denial {
        Denial::Forbidden => messages::PERMISSION_DENIED.to_string(),
        other => other.to_string(),
    }
}

/// The `accion_respuesta` frame reporting a final outcome.
pub fn outcome_message(outcome: ProcessOutcome) -> ServerMessage {
    match outcome {
        ProcessOutcome::Completed { process_id, result } => ServerMessage::AccionRespuesta {
            status: Status::Success,
            process_id: Some(process_id),
            resultado: Some(result),
            mensaje: Some(messages::COMPLETED.to_string()),
        },
        ProcessOutcome::Failed {
            process_id, error, ..
        } => ServerMessage::AccionRespuesta {
            status: Status::Error,
            process_id: Some(process_id),
            resultado: None,
            mensaje: Some(error),
        },
        ProcessOutcome::Interrupted { process_id } => ServerMessage::AccionRespuesta {
            status: Status::Error,
            process_id: Some(process_id),
            resultado: None,
            mensaje: Some(messages::PROCESS_INTERRUPTED.to_string()),
        },
        ProcessOutcome::Dropped { reason } => ServerMessage::accion_error(reason.to_string()),
    }
}
