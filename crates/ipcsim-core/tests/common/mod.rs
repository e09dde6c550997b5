// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for ipcsim-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use ipcsim_core::{
    Action, ActionType, Dispatcher, PermissionTable, Process, ProcessType, SchedulerConfig,
    SchedulerEvent, SimulatedWorkload, Workload, WorkloadError,
};

/// Workload that fails every attempt after a fixed delay and counts calls.
#[derive(Default)]
pub struct AlwaysFails {
    pub delay: Duration,
    pub attempts: AtomicU32,
}

impl AlwaysFails {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            attempts: AtomicU32::new(0),
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Workload for AlwaysFails {
    async fn run(&self, process: &Process) -> Result<Value, WorkloadError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        Err(WorkloadError::Other(format!(
            "{} attempt {} failed",
            process.id, attempt
        )))
    }
}

/// Workload that echoes the payload after a fixed delay.
pub struct Echo {
    pub delay: Duration,
}

#[async_trait]
impl Workload for Echo {
    async fn run(&self, process: &Process) -> Result<Value, WorkloadError> {
        tokio::time::sleep(self.delay).await;
        Ok(json!({ "echo": process.data }))
    }
}

/// Scheduler settings with a fixed work duration.
pub fn config(work: Duration, queue_size: usize, max_retries: u32) -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.process.min_duration = work;
    config.process.max_duration = work;
    config.process.max_retries = max_retries;
    config.queue.max_size = queue_size;
    config
}

/// Dispatcher running simulated work of exactly `work`.
pub fn dispatcher(work: Duration, permissions: PermissionTable, queue_size: usize) -> Dispatcher {
    Dispatcher::new(
        permissions,
        Arc::new(SimulatedWorkload::new(work, work)),
        config(work, queue_size, 3),
    )
}

/// Role table with a single custom role.
pub fn single_role(
    role: &str,
    actions: &[ActionType],
    process_types: &[ProcessType],
    max_concurrent: usize,
) -> PermissionTable {
    PermissionTable::new().with_role(ipcsim_core::Permission {
        role: role.to_string(),
        allowed_actions: actions.iter().copied().collect(),
        allowed_process_types: process_types.iter().copied().collect(),
        max_concurrent_processes: max_concurrent,
        can_interrupt: false,
        can_prioritize: false,
    })
}

pub fn database_action() -> Action {
    Action::new(ActionType::Solicitud, ProcessType::Database)
}

/// Collect every event currently buffered on `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
