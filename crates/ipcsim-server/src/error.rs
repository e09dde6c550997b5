// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP-facing error type.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use ipcsim_core::ConfigError;

use crate::auth::AuthError;
use crate::metrics::MetricsError;

/// Errors surfaced by the server.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection limit is reached.
    #[error("Servidor al límite de conexiones")]
    TooManyConnections,

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Token issuing or verification failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Metrics could not be built or exported.
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// Listener or socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::TooManyConnections => StatusCode::SERVICE_UNAVAILABLE,
            Self::Auth(AuthError::Encoding(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Config(_) | Self::Metrics(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() && !matches!(self, Self::TooManyConnections) {
            "Error interno del servidor".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
