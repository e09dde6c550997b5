// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Traffic simulator.
//!
//! Runs many [`IpcClient`]s at once. Each picks a role, and once
//! authenticated submits a random permitted action after every random
//! pause. Aggregate statistics are logged periodically and returned as a
//! [`SimulationReport`] at the end.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use rand::seq::{IteratorRandom, SliceRandom};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ipcsim_core::action::MIN_PRIORITY;
use ipcsim_core::permission::{ROLE_ADMIN, ROLE_OPERATOR, ROLE_VIEWER};
use ipcsim_core::{Action, ActionPayload, Permission};

use crate::client::IpcClient;
use crate::config::{ClientConfig, SimulationConfig};
use crate::state::{ClientEvent, ClientStats};

/// Roles simulated clients pick from.
pub const ROLES: [&str; 3] = [ROLE_ADMIN, ROLE_OPERATOR, ROLE_VIEWER];

/// Highest priority a simulated client requests.
const MAX_SIMULATED_PRIORITY: u8 = 3;

/// A random action `permission` allows, or `None` if it allows nothing.
///
/// Roles that may not prioritize always use the lowest priority.
pub fn random_action(permission: &Permission, rng: &mut impl Rng) -> Option<Action> {
    let action_type = *permission.allowed_actions.iter().choose(rng)?;
    let process_type = *permission.allowed_process_types.iter().choose(rng)?;
    let priority = if permission.can_prioritize {
        rng.gen_range(MIN_PRIORITY..=MAX_SIMULATED_PRIORITY)
    } else {
        MIN_PRIORITY
    };

    let mut data = ActionPayload::new();
    data.insert("timestamp".to_string(), json!(chrono::Utc::now().timestamp_millis()));
    data.insert(
        "parameters".to_string(),
        json!({
            "value": rng.gen_range(0.0..100.0),
            "iterations": rng.gen_range(1..=10),
        }),
    );

    Some(
        Action::new(action_type, process_type)
            .with_priority(priority)
            .with_data(data),
    )
}

/// Latency distribution in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    /// Samples.
    pub count: usize,
    /// Mean.
    pub mean_ms: f64,
    /// Median (nearest rank).
    pub p50_ms: f64,
    /// 95th percentile (nearest rank).
    pub p95_ms: f64,
    /// Slowest sample.
    pub max_ms: f64,
}

impl LatencyStats {
    /// Summarize `samples`.
    pub fn from_samples(samples: &[Duration]) -> Self {
        let Some(&max) = samples.iter().max() else {
            return Self::default();
        };
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let total: Duration = sorted.iter().sum();

        Self {
            count: sorted.len(),
            mean_ms: millis(total) / sorted.len() as f64,
            p50_ms: millis(percentile(&sorted, 50)),
            p95_ms: millis(percentile(&sorted, 95)),
            max_ms: millis(max),
        }
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

/// Nearest-rank percentile of a non-empty sorted slice.
fn percentile(sorted: &[Duration], p: usize) -> Duration {
    let rank = (p * sorted.len()).div_ceil(100).clamp(1, sorted.len());
    sorted[rank - 1]
}

/// Outcome of one simulated client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientReport {
    /// Position in the simulation.
    pub index: usize,
    /// Role the client used.
    pub role: String,
    /// Final counters.
    pub stats: ClientStats,
    /// Why the client stopped early, if it did.
    pub error: Option<String>,
}

/// Aggregate result of a simulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    /// Simulated clients.
    pub clients: usize,
    /// Clients that stopped with an error.
    pub failed_clients: usize,
    /// Clients per role.
    pub clients_by_role: BTreeMap<String, usize>,
    /// Actions sent.
    pub sent: u64,
    /// Successful replies.
    pub succeeded: u64,
    /// Error replies.
    pub failed: u64,
    /// Actions whose connection dropped before the reply.
    pub lost: u64,
    /// Reconnect attempts.
    pub reconnects: u64,
    /// `succeeded / (succeeded + failed + lost)`, 0 when nothing finished.
    pub success_rate: f64,
    /// Request to reply latency.
    pub latency: LatencyStats,
}

impl SimulationReport {
    /// Aggregate per-client reports.
    pub fn from_clients(reports: &[ClientReport]) -> Self {
        let mut summary = Self {
            clients: reports.len(),
            ..Self::default()
        };
        let mut samples = Vec::new();

        for report in reports {
            *summary.clients_by_role.entry(report.role.clone()).or_default() += 1;
            if report.error.is_some() {
                summary.failed_clients += 1;
            }
            let stats = &report.stats;
            summary.sent += stats.sent;
            summary.succeeded += stats.succeeded;
            summary.failed += stats.failed;
            summary.lost += stats.lost;
            summary.reconnects += stats.reconnects;
            samples.extend_from_slice(&stats.latencies);
        }

        let finished = summary.succeeded + summary.failed + summary.lost;
        if finished > 0 {
            summary.success_rate = summary.succeeded as f64 / finished as f64;
        }
        summary.latency = LatencyStats::from_samples(&samples);
        summary
    }
}

struct Running {
    index: usize,
    role: String,
    stats: tokio::sync::watch::Receiver<ClientStats>,
    task: JoinHandle<ClientReport>,
}

/// Drives a fleet of simulated clients.
#[derive(Debug, Clone)]
pub struct TrafficSimulator {
    client: ClientConfig,
    settings: SimulationConfig,
}

impl TrafficSimulator {
    /// Simulator connecting every client with `client` settings.
    pub fn new(client: ClientConfig, settings: SimulationConfig) -> Self {
        Self { client, settings }
    }

    /// Role for the next client.
    ///
    /// Random roles need a token source that can sign for any role;
    /// otherwise every client uses the configured role.
    fn pick_role(&self, rng: &mut impl Rng) -> String {
        match &self.settings.role {
            Some(role) => role.clone(),
            None if self.client.token.issues_any_role() => {
                ROLES.choose(rng).copied().unwrap_or(ROLE_VIEWER).to_string()
            }
            None => self.client.role.clone(),
        }
    }

    /// Run until the configured duration elapses or `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> SimulationReport {
        info!(
            clients = self.settings.clients,
            duration_ms = self.settings.duration.map(|d| d.as_millis() as u64),
            url = %self.client.server_url,
            "Starting traffic simulation"
        );

        let stop = CancellationToken::new();
        let mut running = Vec::with_capacity(self.settings.clients);
        for index in 0..self.settings.clients {
            let role = self.pick_role(&mut rand::thread_rng());
            let client = IpcClient::spawn(self.client.clone().with_role(role.clone()));
            let stats = client.stats_watch();
            let task = tokio::spawn(drive_client(
                index,
                role.clone(),
                client,
                self.settings.clone(),
                stop.child_token(),
            ));
            running.push(Running {
                index,
                role,
                stats,
                task,
            });
        }

        let duration = self.settings.duration;
        let deadline = async move {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);
        tokio::pin!(shutdown);

        let mut ticker = tokio::time::interval(self.settings.report_interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = &mut shutdown => {
                    info!("Simulation interrupted");
                    break;
                }
                _ = ticker.tick() => log_progress(&running),
            }
        }

        stop.cancel();
        let mut reports = Vec::with_capacity(running.len());
        for client in running {
            let report = match client.task.await {
                Ok(report) => report,
                Err(e) => ClientReport {
                    index: client.index,
                    role: client.role,
                    stats: client.stats.borrow().clone(),
                    error: Some(e.to_string()),
                },
            };
            reports.push(report);
        }

        let report = SimulationReport::from_clients(&reports);
        info!(
            clients = report.clients,
            failed_clients = report.failed_clients,
            sent = report.sent,
            succeeded = report.succeeded,
            failed = report.failed,
            lost = report.lost,
            success_rate = report.success_rate,
            mean_latency_ms = report.latency.mean_ms,
            p95_latency_ms = report.latency.p95_ms,
            "Simulation finished"
        );
        report
    }
}

fn log_progress(running: &[Running]) {
    let snapshot: Vec<ClientReport> = running
        .iter()
        .map(|client| ClientReport {
            index: client.index,
            role: client.role.clone(),
            stats: client.stats.borrow().clone(),
            error: None,
        })
        .collect();
    let report = SimulationReport::from_clients(&snapshot);
    let active = running.iter().filter(|c| !c.task.is_finished()).count();
    info!(
        active_clients = active,
        sent = report.sent,
        succeeded = report.succeeded,
        failed = report.failed,
        lost = report.lost,
        mean_latency_ms = format!("{:.2}", report.latency.mean_ms),
        "Simulation statistics"
    );
}

/// Submit random actions through `client` until `stop` fires.
async fn drive_client(
    index: usize,
    role: String,
    mut client: IpcClient,
    settings: SimulationConfig,
    stop: CancellationToken,
) -> ClientReport {
    let mut permission: Option<Permission> = None;
    let next_action = tokio::time::sleep(settings.next_action_delay());
    tokio::pin!(next_action);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            event = client.next_event() => match event {
                Some(ClientEvent::Authenticated(granted)) => permission = Some(granted),
                Some(event) => debug!(client = index, event = ?event, "Client event"),
                None => break,
            },
            _ = &mut next_action => {
                let action = permission
                    .as_ref()
                    .and_then(|p| random_action(p, &mut rand::thread_rng()));
                if let Some(action) = action {
                    if client.submit(action).is_err() {
                        break;
                    }
                }
                next_action
                    .as_mut()
                    .reset(tokio::time::Instant::now() + settings.next_action_delay());
            }
        }
    }

    let last = client.stats();
    match client.shutdown().await {
        Ok(stats) => ClientReport {
            index,
            role,
            stats,
            error: None,
        },
        Err(e) => {
            warn!(client = index, role = %role, error = %e, "Simulated client failed");
            ClientReport {
                index,
                role,
                stats: last,
                error: Some(e.to_string()),
            }
        }
    }
}
