// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process records and their state machine.
//!
//! ```text
//!   ┌─────────┐ start  ┌─────────┐ work done     ┌───────────┐
//!   │ PENDING │───────►│ RUNNING │──────────────►│ COMPLETED │
//!   └─────────┘        └────┬────┘               └───────────┘
//!                        ▲  │  │ cancel observed ┌─────────────┐
//!                  retry │  │  └────────────────►│ INTERRUPTED │
//!                        └──┤                    └─────────────┘
//!                           │ retries exhausted  ┌────────┐
//!                           └───────────────────►│ FAILED │
//!                                                └────────┘
//! ```
//!
//! Only the registry hands out mutable access, and only the lifecycle
//! drives these transitions.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionPayload, ActionType, ProcessType};
use crate::error::{CoreError, Result};

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Created, not started.
    Pending,
    /// Executing; member of the active set.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed after exhausting retries.
    Failed,
    /// Stopped by an interrupt request.
    Interrupted,
}

impl ProcessState {
    /// Every state, in lifecycle order.
    pub const ALL: [ProcessState; 5] = [
        ProcessState::Pending,
        ProcessState::Running,
        ProcessState::Completed,
        ProcessState::Failed,
        ProcessState::Interrupted,
    ];

    /// Whether no further transition can leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Failed | ProcessState::Interrupted
        )
    }

    /// Lowercase state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Pending => "pending",
            ProcessState::Running => "running",
            ProcessState::Completed => "completed",
            ProcessState::Failed => "failed",
            ProcessState::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to create a process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    /// Requested action kind.
    pub action_type: ActionType,
    /// Process kind.
    pub process_type: ProcessType,
    /// Informational priority.
    pub priority: u8,
    /// Opaque payload.
    pub data: ActionPayload,
    /// Requesting connection.
    pub owner: String,
    /// Role at admission time.
    pub role: String,
}

impl ProcessSpec {
    /// Build a spec from an admitted action.
    pub fn from_action(action: Action, owner: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            action_type: action.action_type,
            process_type: action.process_type,
            priority: action.priority,
            data: action.data,
            owner: owner.into(),
            role: role.into(),
        }
    }
}

/// A process record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Unique, never reused.
    pub id: String,
    /// Requested action kind.
    pub action_type: ActionType,
    /// Process kind.
    #[serde(rename = "type")]
    pub process_type: ProcessType,
    /// Informational priority.
    pub priority: u8,
    /// Opaque payload.
    pub data: ActionPayload,
    /// Requesting connection.
    pub owner: String,
    /// Role frozen at admission time.
    pub role: String,
    /// Current state.
    pub state: ProcessState,
    /// When the process entered RUNNING.
    pub start_time: Option<DateTime<Utc>>,
    /// When the process reached a terminal state.
    pub end_time: Option<DateTime<Utc>>,
    /// Retries consumed so far.
    pub retries: u32,
    /// Set by an interrupt request, observed at the next poll.
    pub cancel_requested: bool,
    /// Failure detail of a FAILED process.
    pub error: Option<String>,
}

impl Process {
    /// Create a PENDING process.
    pub fn new(id: impl Into<String>, spec: ProcessSpec) -> Self {
        Self {
            id: id.into(),
            action_type: spec.action_type,
            process_type: spec.process_type,
            priority: spec.priority,
            data: spec.data,
            owner: spec.owner,
            role: spec.role,
            state: ProcessState::Pending,
            start_time: None,
            end_time: None,
            retries: 0,
            cancel_requested: false,
            error: None,
        }
    }

    /// Whether the process reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Wall-clock time between start and end, if both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.end_time? - self.start_time?)
    }

    pub(crate) fn mark_running(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_state(ProcessState::Pending, ProcessState::Running)?;
        self.state = ProcessState::Running;
        self.start_time = Some(now);
        Ok(())
    }

    /// Re-enter RUNNING after a transient failure.
    pub(crate) fn mark_retry(&mut self) -> Result<()> {
        self.expect_state(ProcessState::Running, ProcessState::Running)?;
        self.retries += 1;
        self.error = None;
        Ok(())
    }

    pub(crate) fn finish(
        &mut self,
        state: ProcessState,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<()> {
        debug_assert!(state.is_terminal());
        self.expect_state(ProcessState::Running, state)?;
        self.state = state;
        self.end_time = Some(now);
        self.error = error;
        Ok(())
    }

    fn expect_state(&self, expected: ProcessState, to: ProcessState) -> Result<()> {
        if self.state != expected {
            return Err(CoreError::InvalidTransition {
                process_id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        Ok(())
    }
}

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

/// Generate a process id: `{owner}-{unix millis}-{random base36 suffix}`.
pub fn generate_process_id(owner: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}-{}", owner, Utc::now().timestamp_millis(), suffix)
}
