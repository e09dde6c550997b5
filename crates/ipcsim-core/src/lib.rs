// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ipcsim Core - Admission-Controlled Process Scheduler
//!
//! This crate decides whether a client's action may run, when it runs, and
//! drives the resulting simulated process to a terminal state. It keeps all
//! state in memory; nothing survives a restart.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Transport (ipcsim-server)                         │
//! │              auth / accion / interrumpir / connection close              │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌───────────────────────┐   deny   ┌─────────────────────────────────────┐
//! │    PermissionGate     │─────────►│  Denial (forbidden / queue full)     │
//! └───────────────────────┘          └─────────────────────────────────────┘
//!           │ admit
//!           ▼
//! ┌───────────────────────┐  limit reached   ┌─────────────────────────────┐
//! │      Dispatcher       │─────────────────►│  BoundedQueue (per owner)   │
//! └───────────────────────┘◄─────────────────└─────────────────────────────┘
//!           │ start             slot freed: pop + re-admit
//!           ▼
//! ┌───────────────────────┐   terminal state   ┌───────────────────────────┐
//! │   ProcessLifecycle    │───────────────────►│     ProcessRegistry       │
//! │  (one task/process)   │                    │  (all + active set)       │
//! └───────────────────────┘                    └───────────────────────────┘
//!           │
//!           ▼
//!   SchedulerEvent broadcast (metrics, logging)
//! ```
//!
//! # Admission Rules
//!
//! | Step | Outcome |
//! |------|---------|
//! | Role does not allow the action or process type | `forbidden` |
//! | Owner below its role's cap and nothing queued | process starts now |
//! | Otherwise, room in the owner's queue | action queued |
//! | Otherwise | `queue full` |
//!
//! Queued actions are popped in FIFO order whenever a process of the same
//! owner ends, and are checked against the permission table again at that
//! point. `priority` is carried through but never reorders anything.
//!
//! # Process States
//!
//! | State | Meaning |
//! |-------|---------|
//! | `pending` | Created, not started |
//! | `running` | Executing; counted against the owner's cap |
//! | `completed` | Work finished |
//! | `failed` | Every attempt failed (`max_retries + 1` attempts) |
//! | `interrupted` | Interrupt observed at a poll boundary |
//!
//! # Configuration
//!
//! See [`config::SchedulerConfig::from_env`] and
//! [`config::permissions_from_env`] for the environment variables.

#![deny(missing_docs)]

/// Action requests and their kinds.
pub mod action;

/// Periodic registry and queue maintenance.
pub mod cleanup_worker;

/// Scheduler configuration loaded from environment variables.
pub mod config;

/// Admission, queueing and promotion of actions.
pub mod dispatcher;

/// Error types with stable error codes.
pub mod error;

/// Scheduler notifications.
pub mod events;

/// Process state machine driver and workloads.
pub mod lifecycle;

/// Role permissions and the admission gate.
pub mod permission;

/// Process records.
pub mod process;

/// Bounded per-owner action queue.
pub mod queue;

/// Process storage and the active set.
pub mod registry;

/// Embeddable runtime (dispatcher plus cleanup worker).
pub mod runtime;

pub use action::{Action, ActionPayload, ActionType, ProcessType};
pub use config::{ConfigError, SchedulerConfig, env_parse};
pub use dispatcher::{
    Completion, Denial, Dispatcher, InterruptOutcome, ReleaseSummary, Submission,
};
pub use error::{CoreError, Result};
pub use events::{EventSink, SchedulerEvent};
pub use lifecycle::{
    DropReason, ProcessLifecycle, ProcessOutcome, SimulatedWorkload, Workload, WorkloadError,
};
pub use permission::{Permission, PermissionGate, PermissionTable};
pub use process::{Process, ProcessSpec, ProcessState};
pub use queue::{BoundedQueue, QueueEntry, QueueStats};
pub use registry::ProcessRegistry;
pub use runtime::SchedulerRuntime;
