// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection-independent client state.
//!
//! [`ClientState`] decides which frames to send and interprets the replies;
//! the driver in [`crate::client`] only moves frames over the socket.
//!
//! Actions beyond the role's concurrency cap, or submitted while the client
//! is not authenticated, wait in a local [`BoundedQueue`]. The queue is
//! flushed after authentication and whenever a reply frees a slot, and it
//! survives reconnects. Actions sent on a connection that drops before
//! their reply arrives are counted as lost.
//!
//! The server does not echo request ids, so a reply is attributed to the
//! oldest outstanding request. Latency samples are exact while processes
//! finish in submission order and approximate otherwise.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ipcsim_core::{Action, BoundedQueue, Permission, QueueEntry};
use ipcsim_server::protocol::AuthRequest;
use ipcsim_server::{ClientMessage, ServerMessage, Status};

use crate::error::SubmitRejection;

/// Owner recorded on locally queued entries.
const LOCAL_OWNER: &str = "local";

/// Counters of one client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientStats {
    /// `accion` frames sent.
    pub sent: u64,
    /// Replies with status `success`.
    pub succeeded: u64,
    /// Replies with status `error`.
    pub failed: u64,
    /// Sent actions whose connection dropped before the reply.
    pub lost: u64,
    /// Queued actions discarded because the role no longer allows them.
    pub dropped: u64,
    /// Reconnect attempts.
    pub reconnects: u64,
    /// Time from sending an action to its reply.
    pub latencies: Vec<Duration>,
}

/// Reply to an `accion`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionReply {
    /// Outcome.
    pub status: Status,
    /// Process that served the action.
    pub process_id: Option<String>,
    /// Result payload of a completed process.
    pub resultado: Option<Value>,
    /// Error detail.
    pub mensaje: Option<String>,
    /// Time since the matching request was sent.
    pub latency: Option<Duration>,
}

/// Something the client observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The server admitted the role.
    Authenticated(Permission),
    /// The server refused the credentials.
    AuthFailed(String),
    /// An action finished or was refused.
    ActionFinished(ActionReply),
    /// Answer to an interrupt request.
    Interruption {
        /// Outcome.
        status: Status,
        /// Detail.
        mensaje: String,
    },
    /// The server could not attribute a frame.
    ServerError(String),
    /// A submission was not accepted locally.
    Rejected(SubmitRejection),
    /// The connection dropped.
    Disconnected {
        /// Sent actions that will not get a reply.
        lost: usize,
    },
    /// Waiting before the next connection attempt.
    Reconnecting {
        /// Attempt number since the last successful connection.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
}

/// Sans-IO protocol state of one client.
#[derive(Debug)]
pub struct ClientState {
    role: String,
    permission: Option<Permission>,
    in_flight: VecDeque<Instant>,
    pending: BoundedQueue,
    stats: ClientStats,
}

impl ClientState {
    /// State for a client authenticating as `role`.
    pub fn new(role: impl Into<String>, pending_queue_size: usize) -> Self {
        Self {
            role: role.into(),
            permission: None,
            in_flight: VecDeque::new(),
            pending: BoundedQueue::new(pending_queue_size),
            stats: ClientStats::default(),
        }
    }

    /// Role the client authenticates as.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Whether the current connection is authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.permission.is_some()
    }

    /// Permission record received at authentication.
    pub fn permission(&self) -> Option<&Permission> {
        self.permission.as_ref()
    }

    /// Actions sent and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Actions waiting in the local queue.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Counters so far.
    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// The `auth` frame that opens a connection.
    pub fn on_connected(&mut self, token: String) -> ClientMessage {
        ClientMessage::Auth(AuthRequest {
            role: self.role.clone(),
            token,
        })
    }

    /// Accept an action. Returns the frame to send now, or `None` when the
    /// action waits in the local queue.
    pub fn submit(&mut self, action: Action) -> Result<Option<ClientMessage>, SubmitRejection> {
        action.validate().map_err(|_| SubmitRejection::Invalid)?;

        if let Some(permission) = &self.permission {
            if !permission.allows(action.action_type, action.process_type) {
                return Err(SubmitRejection::NotPermitted);
            }
            if self.pending.is_empty()
                && self.in_flight.len() < permission.max_concurrent_processes
            {
                return Ok(Some(self.send_action(action)));
            }
        }

        self.pending
            .try_enqueue(QueueEntry::new(action, LOCAL_OWNER, self.role.clone()))?;
        Ok(None)
    }

    /// Interpret a server frame. Returns the observed event and the frames
    /// to send in response.
    pub fn on_message(
        &mut self,
        message: ServerMessage,
    ) -> (Option<ClientEvent>, Vec<ClientMessage>) {
        match message {
            ServerMessage::AuthResponse {
                status: Status::Success,
                permissions: Some(permission),
                ..
            } => {
                info!(
                    role = %self.role,
                    max_concurrent = permission.max_concurrent_processes,
                    pending = self.pending.len(),
                    "Authenticated"
                );
                self.permission = Some(permission.clone());
                (Some(ClientEvent::Authenticated(permission)), self.flush())
            }
            ServerMessage::AuthResponse { mensaje, .. } => {
                let mensaje = mensaje.unwrap_or_else(|| "Error de autenticación".to_string());
                warn!(role = %self.role, reason = %mensaje, "Authentication rejected");
                self.permission = None;
                (Some(ClientEvent::AuthFailed(mensaje)), Vec::new())
            }
            ServerMessage::AccionRespuesta {
                status,
                process_id,
                resultado,
                mensaje,
            } => {
                let latency = self.in_flight.pop_front().map(|sent| sent.elapsed());
                if let Some(latency) = latency {
                    self.stats.latencies.push(latency);
                }
                match status {
                    Status::Success => self.stats.succeeded += 1,
                    Status::Error => self.stats.failed += 1,
                }
                debug!(
                    process_id = process_id.as_deref().unwrap_or("-"),
                    status = ?status,
                    latency_ms = latency.map(|l| l.as_millis() as u64),
                    mensaje = mensaje.as_deref(),
                    "Action answered"
                );
                let reply = ActionReply {
                    status,
                    process_id,
                    resultado,
                    mensaje,
                    latency,
                };
                (Some(ClientEvent::ActionFinished(reply)), self.flush())
            }
            ServerMessage::InterrupcionRespuesta { status, mensaje } => {
                info!(status = ?status, mensaje = %mensaje, "Interrupt answered");
                (Some(ClientEvent::Interruption { status, mensaje }), Vec::new())
            }
            ServerMessage::Error { mensaje } => {
                warn!(mensaje = %mensaje, "Server reported an error");
                (Some(ClientEvent::ServerError(mensaje)), Vec::new())
            }
        }
    }

    /// Forget the connection. Returns how many sent actions lost their reply.
    pub fn on_disconnect(&mut self) -> usize {
        self.permission = None;
        let lost = self.in_flight.len();
        self.in_flight.clear();
        self.stats.lost += lost as u64;
        if lost > 0 || !self.pending.is_empty() {
            warn!(lost, pending = self.pending.len(), "Connection lost");
        }
        lost
    }

    /// Count a reconnect attempt.
    pub fn on_reconnect_attempt(&mut self) {
        self.stats.reconnects += 1;
    }

    /// Send queued actions while slots are free.
    fn flush(&mut self) -> Vec<ClientMessage> {
        let mut frames = Vec::new();
        let Some(permission) = self.permission.clone() else {
            return frames;
        };

        while self.in_flight.len() < permission.max_concurrent_processes {
            let Some(entry) = self.pending.dequeue() else {
                break;
            };
            let action = entry.action;
            if !permission.allows(action.action_type, action.process_type) {
                self.stats.dropped += 1;
                warn!(
                    role = %self.role,
                    action_type = %action.action_type,
                    process_type = %action.process_type,
                    "Queued action no longer permitted, dropped"
                );
                continue;
            }
            frames.push(self.send_action(action));
        }
        frames
    }

    fn send_action(&mut self, action: Action) -> ClientMessage {
        self.in_flight.push_back(Instant::now());
        self.stats.sent += 1;
        debug!(
            action_type = %action.action_type,
            process_type = %action.process_type,
            priority = action.priority,
            in_flight = self.in_flight.len(),
            "Sending action"
        );
        ClientMessage::Accion(action)
    }
}
