// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for periodic scheduler maintenance.
//!
//! Each pass:
//! 1. Removes terminal processes that ended more than `retention` ago
//! 2. Drops queued actions that waited longer than `queue_max_age`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::dispatcher::Dispatcher;

/// Configuration for the cleanup worker.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupWorkerConfig {
    /// How often to run cleanup.
    pub poll_interval: Duration,
    /// How long terminal processes are kept.
    pub retention: Duration,
    /// Maximum time an action may wait in a queue.
    pub queue_max_age: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for CleanupWorkerConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            poll_interval: config.cleanup_interval,
            retention: config.retention,
            queue_max_age: config.queue.max_age,
        }
    }
}

/// Result of a single cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Processes removed from the registry.
    pub processes_removed: usize,
    /// Queued actions dropped as expired.
    pub actions_pruned: usize,
}

/// Background worker that keeps the registry and queues bounded.
pub struct CleanupWorker {
    dispatcher: Dispatcher,
    config: CleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl CleanupWorker {
    /// Create a new cleanup worker.
    pub fn new(dispatcher: Dispatcher, config: CleanupWorkerConfig) -> Self {
        Self {
            dispatcher,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            retention_ms = self.config.retention.as_millis() as u64,
            queue_max_age_ms = self.config.queue_max_age.as_millis() as u64,
            "Cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.run_once().await;
                }
            }
        }

        info!("Cleanup worker stopped");
    }

    /// Run a single cleanup pass.
    pub async fn run_once(&self) -> CleanupReport {
        let processes_removed = self.dispatcher.registry().cleanup(self.config.retention);
        let actions_pruned = self
            .dispatcher
            .prune_queues(self.config.queue_max_age)
            .await;

        if processes_removed > 0 || actions_pruned > 0 {
            info!(processes_removed, actions_pruned, "Cleanup pass finished");
        } else {
            debug!("Cleanup pass found nothing to remove");
        }

        CleanupReport {
            processes_removed,
            actions_pruned,
        }
    }
}
