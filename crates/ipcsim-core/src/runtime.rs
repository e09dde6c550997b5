// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for ipcsim-core.
//!
//! [`SchedulerRuntime`] wires the permission table, configuration and
//! workload into a [`Dispatcher`] and runs the cleanup worker next to it.
//!
//! # Example
//!
//! ```rust,ignore
//! use ipcsim_core::runtime::SchedulerRuntime;
//! use ipcsim_core::config::{SchedulerConfig, permissions_from_env};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = SchedulerRuntime::builder()
//!         .config(SchedulerConfig::from_env()?)
//!         .permissions(permissions_from_env()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let dispatcher = runtime.dispatcher().clone();
//!     // ... submit actions ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cleanup_worker::{CleanupWorker, CleanupWorkerConfig};
use crate::config::SchedulerConfig;
use crate::dispatcher::Dispatcher;
use crate::lifecycle::{SimulatedWorkload, Workload};
use crate::permission::PermissionTable;

/// Builder for creating a [`SchedulerRuntime`].
#[derive(Default)]
pub struct SchedulerRuntimeBuilder {
    config: SchedulerConfig,
    permissions: Option<PermissionTable>,
    workload: Option<Arc<dyn Workload>>,
}

impl std::fmt::Debug for SchedulerRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerRuntimeBuilder")
            .field("config", &self.config)
            .field("permissions", &self.permissions)
            .field("workload", &self.workload.as_ref().map(|_| "..."))
            .finish()
    }
}

impl SchedulerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scheduler configuration.
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the role table.
    ///
    /// Default: [`PermissionTable::defaults`]
    pub fn permissions(mut self, permissions: PermissionTable) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Set the workload run by every process.
    ///
    /// Default: a [`SimulatedWorkload`] built from the process settings.
    pub fn workload(mut self, workload: Arc<dyn Workload>) -> Self {
        self.workload = Some(workload);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if the configuration is inconsistent.
    pub fn build(self) -> Result<SchedulerRuntimeConfig> {
        self.config.validate()?;

        let workload = self
            .workload
            .unwrap_or_else(|| Arc::new(SimulatedWorkload::from_config(&self.config.process)));

        Ok(SchedulerRuntimeConfig {
            config: self.config,
            permissions: self.permissions.unwrap_or_else(PermissionTable::defaults),
            workload,
        })
    }
}

/// Validated configuration for a [`SchedulerRuntime`].
pub struct SchedulerRuntimeConfig {
    config: SchedulerConfig,
    permissions: PermissionTable,
    workload: Arc<dyn Workload>,
}

impl std::fmt::Debug for SchedulerRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerRuntimeConfig")
            .field("config", &self.config)
            .field("permissions", &self.permissions)
            .field("workload", &"...")
            .finish()
    }
}

impl SchedulerRuntimeConfig {
    /// Start the runtime, spawning the cleanup worker.
    pub async fn start(self) -> Result<SchedulerRuntime> {
        let cleanup_config = CleanupWorkerConfig::from(&self.config);
        let dispatcher = Dispatcher::new(self.permissions, self.workload, self.config);

        let worker = CleanupWorker::new(dispatcher.clone(), cleanup_config);
        let cleanup_shutdown = worker.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move { worker.run().await });

        info!("SchedulerRuntime started");

        Ok(SchedulerRuntime {
            dispatcher,
            cleanup_handle,
            cleanup_shutdown,
        })
    }
}

/// A running scheduler that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct SchedulerRuntime {
    dispatcher: Dispatcher,
    cleanup_handle: JoinHandle<()>,
    cleanup_shutdown: Arc<Notify>,
}

impl SchedulerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> SchedulerRuntimeBuilder {
        SchedulerRuntimeBuilder::new()
    }

    /// The dispatcher accepting actions.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops admissions, interrupts running processes, drops queued actions
    /// and waits for the cleanup worker to exit.
    pub async fn shutdown(self) -> Result<()> {
        info!("SchedulerRuntime shutting down...");

        self.dispatcher.shutdown().await;
        self.cleanup_shutdown.notify_one();

        match self.cleanup_handle.await {
            Ok(()) => {
                info!("SchedulerRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Cleanup worker task panicked: {}", e);
                Err(anyhow::anyhow!("cleanup worker panicked: {}", e))
            }
        }
    }

    /// Check if the cleanup worker is still running.
    pub fn is_running(&self) -> bool {
        !self.cleanup_handle.is_finished()
    }
}
