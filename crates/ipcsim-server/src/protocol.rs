// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WebSocket message framing.
//!
//! Every frame is a JSON text message `{"event": <name>, "data": <payload>}`.
//! Event names and response fields keep the wire vocabulary existing clients
//! speak (`accion`, `mensaje`, ...).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ipcsim_core::{Action, Permission};

/// Inbound event names.
pub mod events {
    /// Authenticate the connection.
    pub const AUTH: &str = "auth";
    /// Submit an action.
    pub const ACCION: &str = "accion";
    /// Interrupt a process.
    pub const INTERRUMPIR: &str = "interrumpir";
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Credentials of an `auth` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Claimed role.
    pub role: String,
    /// Session token.
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InterruptTarget {
    Id(String),
    #[serde(rename_all = "camelCase")]
    Object {
        process_id: String,
    },
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `auth {role, token}`
    Auth(AuthRequest),
    /// `accion {type, processType, priority, data}`
    Accion(Action),
    /// `interrumpir {processId}` (a bare id string is accepted too)
    Interrumpir {
        /// Target process.
        process_id: String,
    },
}

/// Why a frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Not JSON, or no `event` field.
    #[error("Mensaje mal formado: {0}")]
    Malformed(String),
    /// The event name is not recognised.
    #[error("Evento desconocido: {0}")]
    UnknownEvent(String),
    /// The payload does not match the event.
    #[error("{message}")]
    InvalidPayload {
        /// Event the payload belonged to.
        event: &'static str,
        /// Decoding error.
        message: String,
    },
}

impl ProtocolError {
    /// The response frame reporting this error to the client.
    pub fn to_response(&self) -> ServerMessage {
        match self {
            ProtocolError::InvalidPayload { event, message } => match *event {
                events::AUTH => ServerMessage::auth_error(message.clone()),
                events::ACCION => ServerMessage::accion_error(message.clone()),
                _ => ServerMessage::interrupcion(Status::Error, message.clone()),
            },
            other => ServerMessage::Error {
                mensaje: other.to_string(),
            },
        }
    }
}

impl ClientMessage {
    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match envelope.event.as_str() {
            events::AUTH => serde_json::from_value(envelope.data)
                .map(ClientMessage::Auth)
                .map_err(|e| invalid(events::AUTH, e)),
            events::ACCION => serde_json::from_value(envelope.data)
                .map(ClientMessage::Accion)
                .map_err(|e| invalid(events::ACCION, e)),
            events::INTERRUMPIR => serde_json::from_value::<InterruptTarget>(envelope.data)
                .map(|target| ClientMessage::Interrumpir {
                    process_id: match target {
                        InterruptTarget::Id(id) | InterruptTarget::Object { process_id: id } => id,
                    },
                })
                .map_err(|e| invalid(events::INTERRUMPIR, e)),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    /// Encode as a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let (event, data) = match self {
            ClientMessage::Auth(request) => (events::AUTH, serde_json::to_value(request)?),
            ClientMessage::Accion(action) => (events::ACCION, serde_json::to_value(action)?),
            ClientMessage::Interrumpir { process_id } => (
                events::INTERRUMPIR,
                serde_json::json!({ "processId": process_id }),
            ),
        };
        serde_json::to_string(&Envelope {
            event: event.to_string(),
            data,
        })
    }
}

fn invalid(event: &'static str, e: serde_json::Error) -> ProtocolError {
    ProtocolError::InvalidPayload {
        event,
        message: e.to_string(),
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The request succeeded.
    Success,
    /// The request failed; see `mensaje`.
    Error,
}

/// A frame sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Answer to `auth`.
    AuthResponse {
        /// Outcome.
        status: Status,
        /// Permission record of the admitted role.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        permissions: Option<Permission>,
        /// Error detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mensaje: Option<String>,
    },
    /// Answer to `accion`, sent once the process ends (or immediately on denial).
    AccionRespuesta {
        /// Outcome.
        status: Status,
        /// Process that served the action.
        #[serde(
            rename = "processId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        process_id: Option<String>,
        /// Result payload of a completed process.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resultado: Option<Value>,
        /// Human readable detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mensaje: Option<String>,
    },
    /// Answer to `interrumpir`.
    InterrupcionRespuesta {
        /// Outcome.
        status: Status,
        /// Human readable detail.
        mensaje: String,
    },
    /// Frame that could not be attributed to a request.
    Error {
        /// Human readable detail.
        mensaje: String,
    },
}

impl ServerMessage {
    /// Successful `auth_response`.
    pub fn auth_success(permission: Permission) -> Self {
        Self::AuthResponse {
            status: Status::Success,
            permissions: Some(permission),
            mensaje: None,
        }
    }

    /// Failed `auth_response`.
    pub fn auth_error(mensaje: impl Into<String>) -> Self {
        Self::AuthResponse {
            status: Status::Error,
            permissions: None,
            mensaje: Some(mensaje.into()),
        }
    }

    /// Failed `accion_respuesta`.
    pub fn accion_error(mensaje: impl Into<String>) -> Self {
        Self::AccionRespuesta {
            status: Status::Error,
            process_id: None,
            resultado: None,
            mensaje: Some(mensaje.into()),
        }
    }

    /// `interrupcion_respuesta`.
    pub fn interrupcion(status: Status, mensaje: impl Into<String>) -> Self {
        Self::InterrupcionRespuesta {
            status,
            mensaje: mensaje.into(),
        }
    }

    /// Encode as a text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to encode server message");
            r#"{"event":"error","data":{"mensaje":"Error interno del servidor"}}"#.to_string()
        })
    }
}
