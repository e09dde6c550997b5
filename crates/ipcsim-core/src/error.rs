// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for ipcsim-core.
//!
//! Provides a unified error type with stable error codes that the transport
//! layer can put on the wire.

use thiserror::Error;

use crate::process::ProcessState;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while scheduling or running processes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    /// Process was not found in the registry.
    #[error("Process '{process_id}' not found")]
    ProcessNotFound {
        /// The process ID that was not found.
        process_id: String,
    },

    /// A process with this ID already exists.
    #[error("Process '{process_id}' already exists")]
    ProcessAlreadyExists {
        /// The process ID that already exists.
        process_id: String,
    },

    /// The requested state transition is not allowed from the current state.
    #[error("Process '{process_id}' cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        /// The process ID.
        process_id: String,
        /// The current state.
        from: ProcessState,
        /// The requested state.
        to: ProcessState,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ProcessNotFound { .. } => "PROCESS_NOT_FOUND",
            Self::ProcessAlreadyExists { .. } => "PROCESS_ALREADY_EXISTS",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
        }
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}
