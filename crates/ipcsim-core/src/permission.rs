// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Role permissions and the admission gate.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::action::{ActionType, ProcessType};

/// Built-in administrator role.
pub const ROLE_ADMIN: &str = "admin";
/// Built-in operator role.
pub const ROLE_OPERATOR: &str = "operator";
/// Built-in read-only role.
pub const ROLE_VIEWER: &str = "viewer";

/// Permission record of a single role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    /// Role this record belongs to.
    pub role: String,
    /// Action kinds the role may request.
    #[serde(rename = "actions")]
    pub allowed_actions: BTreeSet<ActionType>,
    /// Process kinds the role may request.
    #[serde(rename = "processTypes")]
    pub allowed_process_types: BTreeSet<ProcessType>,
    /// Per-owner cap on running processes.
    pub max_concurrent_processes: usize,
    /// Whether the role may interrupt processes it does not own.
    pub can_interrupt: bool,
    /// Whether the role may request elevated priorities.
    pub can_prioritize: bool,
}

impl Permission {
    /// Check whether this role may run `process_type` through `action_type`.
    pub fn allows(&self, action_type: ActionType, process_type: ProcessType) -> bool {
        self.allowed_actions.contains(&action_type)
            && self.allowed_process_types.contains(&process_type)
    }
}

/// Immutable role table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionTable {
    roles: HashMap<String, Permission>,
}

impl PermissionTable {
    /// Create an empty table. Every role is unknown.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock admin/operator/viewer table.
    pub fn defaults() -> Self {
        Self::new()
            .with_role(Permission {
                role: ROLE_ADMIN.to_string(),
                allowed_actions: ActionType::ALL.into_iter().collect(),
                allowed_process_types: ProcessType::ALL.into_iter().collect(),
                max_concurrent_processes: 10,
                can_interrupt: true,
                can_prioritize: true,
            })
            .with_role(Permission {
                role: ROLE_OPERATOR.to_string(),
                allowed_actions: [
                    ActionType::Solicitud,
                    ActionType::Actualizacion,
                    ActionType::Consulta,
                ]
                .into_iter()
                .collect(),
                allowed_process_types: [
                    ProcessType::Calculation,
                    ProcessType::Database,
                    ProcessType::FileOperation,
                ]
                .into_iter()
                .collect(),
                max_concurrent_processes: 5,
                can_interrupt: false,
                can_prioritize: true,
            })
            .with_role(Permission {
                role: ROLE_VIEWER.to_string(),
                allowed_actions: [ActionType::Consulta, ActionType::Reporte]
                    .into_iter()
                    .collect(),
                allowed_process_types: [ProcessType::Analysis].into_iter().collect(),
                max_concurrent_processes: 2,
                can_interrupt: false,
                can_prioritize: false,
            })
    }

    /// Add or replace a role.
    pub fn with_role(mut self, permission: Permission) -> Self {
        self.roles.insert(permission.role.clone(), permission);
        self
    }

    /// Override the concurrency cap of an existing role. Unknown roles are ignored.
    pub fn with_max_concurrent(mut self, role: &str, max: usize) -> Self {
        if let Some(permission) = self.roles.get_mut(role) {
            permission.max_concurrent_processes = max;
        }
        self
    }

    /// Look up a role.
    pub fn get(&self, role: &str) -> Option<&Permission> {
        self.roles.get(role)
    }

    /// Whether the role exists.
    pub fn contains(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    /// Names of all roles.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }
}

/// Stateless admission rule evaluator over a shared role table.
#[derive(Debug, Clone)]
pub struct PermissionGate {
    table: Arc<PermissionTable>,
}

impl PermissionGate {
    /// Create a gate over `table`.
    pub fn new(table: Arc<PermissionTable>) -> Self {
        Self { table }
    }

    /// Admission decision. Unknown roles are always denied.
    pub fn admit(&self, role: &str, action_type: ActionType, process_type: ProcessType) -> bool {
        self.table
            .get(role)
            .is_some_and(|p| p.allows(action_type, process_type))
    }

    /// Concurrency cap of `role`, `None` for unknown roles.
    pub fn max_concurrent(&self, role: &str) -> Option<usize> {
        self.table.get(role).map(|p| p.max_concurrent_processes)
    }

    /// Whether `role` may interrupt processes it does not own.
    pub fn can_interrupt(&self, role: &str) -> bool {
        self.table.get(role).is_some_and(|p| p.can_interrupt)
    }

    /// The role table behind this gate.
    pub fn table(&self) -> &Arc<PermissionTable> {
        &self.table
    }
}
