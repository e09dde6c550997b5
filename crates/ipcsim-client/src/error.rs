// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client error types.

use thiserror::Error;

use ipcsim_core::ConfigError;
use ipcsim_core::queue::QueueRejection;
use ipcsim_server::AuthError;

/// Errors that stop a client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A session token could not be issued.
    #[error("token error: {0}")]
    Token(#[from] AuthError),

    /// The server refused the credentials.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The server stayed unreachable.
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted {
        /// Reconnect attempts made since the last successful connection.
        attempts: u32,
    },

    /// A frame could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The connection task ended unexpectedly.
    #[error("client task stopped: {0}")]
    Stopped(String),
}

/// Why a submitted action was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitRejection {
    /// The role may not request this action.
    #[error("action not permitted for this role")]
    NotPermitted,

    /// The local pending queue is full.
    #[error("pending queue full")]
    QueueFull,

    /// The action failed validation.
    #[error("invalid action")]
    Invalid,

    /// Interrupts need an authenticated connection.
    #[error("not authenticated")]
    NotAuthenticated,
}

impl From<QueueRejection> for SubmitRejection {
    fn from(rejection: QueueRejection) -> Self {
        match rejection {
            QueueRejection::Full => SubmitRejection::QueueFull,
            QueueRejection::Invalid => SubmitRejection::Invalid,
        }
    }
}
