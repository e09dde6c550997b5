// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Action requests submitted by clients.
//!
//! Wire names follow the protocol spoken by existing clients, so the action
//! kinds keep their Spanish identifiers (`solicitud`, `consulta`, ...).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Lowest accepted priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest accepted priority.
pub const MAX_PRIORITY: u8 = 5;

/// Kind of action a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionType {
    /// A new request.
    #[serde(rename = "solicitud")]
    Solicitud,
    /// An update to existing data.
    #[serde(rename = "actualización")]
    Actualizacion,
    /// A read-only query.
    #[serde(rename = "consulta")]
    Consulta,
    /// A report.
    #[serde(rename = "reporte")]
    Reporte,
    /// An interruption request.
    #[serde(rename = "interrumpir")]
    Interrumpir,
}

impl ActionType {
    /// Every action type, in declaration order.
    pub const ALL: [ActionType; 5] = [
        ActionType::Solicitud,
        ActionType::Actualizacion,
        ActionType::Consulta,
        ActionType::Reporte,
        ActionType::Interrumpir,
    ];

    /// Wire name of this action type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Solicitud => "solicitud",
            ActionType::Actualizacion => "actualización",
            ActionType::Consulta => "consulta",
            ActionType::Reporte => "reporte",
            ActionType::Interrumpir => "interrumpir",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::validation("type", format!("unknown action type '{s}'")))
    }
}

/// Kind of simulated process an action runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    /// CPU-style calculation.
    Calculation,
    /// Database work.
    Database,
    /// File operation.
    FileOperation,
    /// Network call.
    Network,
    /// Data analysis.
    Analysis,
}

impl ProcessType {
    /// Every process type, in declaration order.
    pub const ALL: [ProcessType; 5] = [
        ProcessType::Calculation,
        ProcessType::Database,
        ProcessType::FileOperation,
        ProcessType::Network,
        ProcessType::Analysis,
    ];

    /// Wire name of this process type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessType::Calculation => "calculation",
            ProcessType::Database => "database",
            ProcessType::FileOperation => "file_operation",
            ProcessType::Network => "network",
            ProcessType::Analysis => "analysis",
        }
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                CoreError::validation("processType", format!("unknown process type '{s}'"))
            })
    }
}

/// Opaque action payload. Always a JSON object.
pub type ActionPayload = serde_json::Map<String, serde_json::Value>;

/// A client request to run a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// What the client asks for.
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Which kind of process serves the request.
    pub process_type: ProcessType,
    /// Informational priority, 1 (lowest) to 5.
    pub priority: u8,
    /// Opaque payload handed to the process.
    pub data: ActionPayload,
}

impl Action {
    /// Create an action with an empty payload and priority 1.
    pub fn new(action_type: ActionType, process_type: ProcessType) -> Self {
        Self {
            action_type,
            process_type,
            priority: MIN_PRIORITY,
            data: ActionPayload::new(),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the payload.
    pub fn with_data(mut self, data: ActionPayload) -> Self {
        self.data = data;
        self
    }

    /// Structural validation applied once at admission.
    ///
    /// Kinds and payload shape are enforced by the type itself; the priority
    /// range is the only remaining check.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(CoreError::validation(
                "priority",
                format!("must be between {MIN_PRIORITY} and {MAX_PRIORITY}"),
            ));
        }
        Ok(())
    }
}
