// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Prometheus metrics fed by scheduler events.
//!
//! # Metric Families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `ipc_processes_total` | Counter | `process_type`, `role`, `state` |
//! | `ipc_process_duration_seconds` | Histogram | `process_type`, `role`, `state` |
//! | `ipc_active_processes` | Gauge | `process_type`, `role` |
//! | `ipc_queue_size_current` | Gauge | |
//! | `ipc_queue_wait_time_seconds` | Histogram | `process_type`, `priority` |
//! | `ipc_actions_queued_total` | Counter | `process_type` |
//! | `ipc_errors_total` | Counter | `error_type`, `process_type`, `role` |
//! | `ipc_process_retries_total` | Counter | |
//! | `ipc_connections_current` | Gauge | `role` |
//! | `ipc_events_lagged_total` | Counter | |
//!
//! `ipc_processes_total` counts every state a process enters after admission:
//! `running` once per start, then one terminal state.

use std::collections::BTreeMap;
use std::sync::Arc;

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, warn};

use ipcsim_core::{ProcessState, SchedulerEvent};

/// Content type of [`MetricsCollector::encode_text`] output.
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

/// Upper bounds (seconds) of the process duration histogram.
pub const PROCESS_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0];

/// Upper bounds (seconds) of the queue wait histogram.
pub const QUEUE_WAIT_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0];

/// Maximum length of a label value.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// `error_type` of processes that ended FAILED.
const PROCESS_FAILED: &str = "process_failed";

/// Errors raised while building or exporting metrics.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A metric could not be registered.
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    /// The registry could not be encoded.
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Metric families of the scheduler.
#[derive(Clone)]
struct SchedulerMetrics {
    processes_total: CounterVec,
    process_duration: HistogramVec,
    active_processes: GaugeVec,
    queue_size: Gauge,
    queue_wait: HistogramVec,
    actions_queued: CounterVec,
    errors_total: CounterVec,
    retries_total: Counter,
    connections: GaugeVec,
    events_lagged: Counter,
}

impl SchedulerMetrics {
    fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let processes_total = CounterVec::new(
            Opts::new("ipc_processes_total", "Processes entering each state"),
            &["process_type", "role", "state"],
        )?;
        registry.register(Box::new(processes_total.clone()))?;

        let process_duration = HistogramVec::new(
            HistogramOpts::new(
                "ipc_process_duration_seconds",
                "Running time of ended processes",
            )
            .buckets(PROCESS_DURATION_BUCKETS.to_vec()),
            &["process_type", "role", "state"],
        )?;
        registry.register(Box::new(process_duration.clone()))?;

        let active_processes = GaugeVec::new(
            Opts::new("ipc_active_processes", "Processes currently running"),
            &["process_type", "role"],
        )?;
        registry.register(Box::new(active_processes.clone()))?;

        let queue_size = Gauge::with_opts(Opts::new(
            "ipc_queue_size_current",
            "Actions waiting across all owner queues",
        ))?;
        registry.register(Box::new(queue_size.clone()))?;

        let queue_wait = HistogramVec::new(
            HistogramOpts::new(
                "ipc_queue_wait_time_seconds",
                "Time queued actions waited before starting",
            )
            .buckets(QUEUE_WAIT_BUCKETS.to_vec()),
            &["process_type", "priority"],
        )?;
        registry.register(Box::new(queue_wait.clone()))?;

        let actions_queued = CounterVec::new(
            Opts::new("ipc_actions_queued_total", "Actions parked in a queue"),
            &["process_type"],
        )?;
        registry.register(Box::new(actions_queued.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("ipc_errors_total", "Refused actions and failed processes"),
            &["error_type", "process_type", "role"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let retries_total = Counter::with_opts(Opts::new(
            "ipc_process_retries_total",
            "Failed attempts that were retried",
        ))?;
        registry.register(Box::new(retries_total.clone()))?;

        let connections = GaugeVec::new(
            Opts::new("ipc_connections_current", "Open WebSocket connections"),
            &["role"],
        )?;
        registry.register(Box::new(connections.clone()))?;

        let events_lagged = Counter::with_opts(Opts::new(
            "ipc_events_lagged_total",
            "Scheduler events lost because the collector fell behind",
        ))?;
        registry.register(Box::new(events_lagged.clone()))?;

        Ok(Self {
            processes_total,
            process_duration,
            active_processes,
            queue_size,
            queue_wait,
            actions_queued,
            errors_total,
            retries_total,
            connections,
            events_lagged,
        })
    }
}

/// Prometheus registry fed by [`SchedulerEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Registry,
    metrics: SchedulerMetrics,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// Create a collector with every metric family registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let metrics = SchedulerMetrics::new(&registry)?;
        Ok(Self {
            registry,
            metrics,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Apply one event.
    pub fn record(&self, event: &SchedulerEvent) {
        let m = &self.metrics;
        match event {
            SchedulerEvent::ProcessStarted {
                role, process_type, ..
            } => {
                let (process_type, role) = (process_type.as_str(), truncate_label(role));
                m.processes_total
                    .with_label_values(&[process_type, role, ProcessState::Running.as_str()])
                    .inc();
                m.active_processes
                    .with_label_values(&[process_type, role])
                    .inc();
            }
            SchedulerEvent::ProcessRetried { .. } => m.retries_total.inc(),
            SchedulerEvent::ProcessEnded {
                role,
                process_type,
                state,
                duration,
                ..
            } => {
                let (process_type, role) = (process_type.as_str(), truncate_label(role));
                let labels = [process_type, role, state.as_str()];
                m.processes_total.with_label_values(&labels).inc();
                m.process_duration
                    .with_label_values(&labels)
                    .observe(duration.as_secs_f64());
                m.active_processes
                    .with_label_values(&[process_type, role])
                    .dec();
                if *state == ProcessState::Failed {
                    m.errors_total
                        .with_label_values(&[PROCESS_FAILED, process_type, role])
                        .inc();
                }
            }
            SchedulerEvent::ActionDenied {
                role,
                process_type,
                reason,
                ..
            } => {
                m.errors_total
                    .with_label_values(&[
                        truncate_label(reason),
                        process_type.as_str(),
                        truncate_label(role),
                    ])
                    .inc();
            }
            SchedulerEvent::ActionQueued { process_type, .. } => {
                m.actions_queued
                    .with_label_values(&[process_type.as_str()])
                    .inc();
            }
            SchedulerEvent::ActionDequeued {
                process_type,
                priority,
                waited,
                ..
            } => {
                let priority = priority.to_string();
                m.queue_wait
                    .with_label_values(&[process_type.as_str(), priority.as_str()])
                    .observe(waited.as_secs_f64());
            }
            SchedulerEvent::QueueSample { size } => m.queue_size.set(*size as f64),
        }
    }

    /// Replace the per-role connection gauge with `by_role`.
    pub fn set_connections(&self, by_role: &BTreeMap<String, usize>) {
        self.metrics.connections.reset();
        for (role, count) in by_role {
            self.metrics
                .connections
                .with_label_values(&[truncate_label(role)])
                .set(*count as f64);
        }
    }

    /// Encode every metric in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    /// Times a process of `process_type` run by `role` entered `state`.
    #[must_use]
    pub fn process_count(&self, process_type: &str, role: &str, state: &str) -> f64 {
        self.metrics
            .processes_total
            .with_label_values(&[process_type, truncate_label(role), state])
            .get()
    }

    /// Processes of `process_type` run by `role` that are still running.
    #[must_use]
    pub fn active_processes(&self, process_type: &str, role: &str) -> f64 {
        self.metrics
            .active_processes
            .with_label_values(&[process_type, truncate_label(role)])
            .get()
    }

    /// Errors recorded for the label triple.
    #[must_use]
    pub fn error_count(&self, error_type: &str, process_type: &str, role: &str) -> f64 {
        self.metrics
            .errors_total
            .with_label_values(&[error_type, process_type, truncate_label(role)])
            .get()
    }

    /// Last sampled number of queued actions.
    #[must_use]
    pub fn queue_size(&self) -> f64 {
        self.metrics.queue_size.get()
    }

    /// Queue waits observed for `process_type`.
    #[must_use]
    pub fn queue_wait_samples(&self, process_type: &str, priority: u8) -> u64 {
        let priority = priority.to_string();
        self.metrics
            .queue_wait
            .with_label_values(&[process_type, priority.as_str()])
            .get_sample_count()
    }

    /// Retried attempts.
    #[must_use]
    pub fn retries(&self) -> f64 {
        self.metrics.retries_total.get()
    }

    /// Events lost because the collector fell behind.
    #[must_use]
    pub fn events_lagged(&self) -> f64 {
        self.metrics.events_lagged.get()
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Consume events until shutdown or until the channel closes.
    pub async fn run(self, mut events: broadcast::Receiver<SchedulerEvent>) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    debug!("Metrics collector received shutdown signal");
                    break;
                }

                received = events.recv() => match received {
                    Ok(event) => self.record(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Metrics collector lagged behind scheduler events");
                        self.metrics.events_lagged.inc_by(skipped as f64);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}

/// Cut a label value to [`MAX_LABEL_VALUE_LEN`] bytes on a char boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
        .last()
        .unwrap_or(0);
    &value[..end]
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;
    use ipcsim_core::{ActionType, ProcessType};
    use std::time::Duration;

    fn started(role: &str) -> SchedulerEvent {
        SchedulerEvent::ProcessStarted {
            process_id: "p".to_string(),
            owner: "c1".to_string(),
            role: role.to_string(),
            process_type: ProcessType::Calculation,
        }
    }

    fn ended(state: ProcessState, millis: u64) -> SchedulerEvent {
        SchedulerEvent::ProcessEnded {
            process_id: "p".to_string(),
            role: "admin".to_string(),
            process_type: ProcessType::Calculation,
            state,
            duration: Duration::from_millis(millis),
        }
    }

    #[test]
    fn test_process_lifecycle_counters() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record(&started("admin"));
        metrics.record(&started("admin"));
        assert_eq!(metrics.active_processes("calculation", "admin"), 2.0);

        metrics.record(&ended(ProcessState::Completed, 50));
        metrics.record(&ended(ProcessState::Failed, 30_000));

        assert_eq!(metrics.process_count("calculation", "admin", "running"), 2.0);
        assert_eq!(metrics.process_count("calculation", "admin", "completed"), 1.0);
        assert_eq!(metrics.process_count("calculation", "admin", "failed"), 1.0);
        assert_eq!(metrics.active_processes("calculation", "admin"), 0.0);
        assert_eq!(
            metrics.error_count("process_failed", "calculation", "admin"),
            1.0
        );
    }

    #[test]
    fn test_denials_and_queue_metrics() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record(&SchedulerEvent::ActionDenied {
            owner: "c1".to_string(),
            role: "viewer".to_string(),
            action_type: ActionType::Solicitud,
            process_type: ProcessType::Database,
            reason: "forbidden".to_string(),
        });
        metrics.record(&SchedulerEvent::QueueSample { size: 4 });
        metrics.record(&SchedulerEvent::ActionDequeued {
            owner: "c1".to_string(),
            process_type: ProcessType::Network,
            priority: 3,
            waited: Duration::from_millis(1500),
        });

        assert_eq!(metrics.error_count("forbidden", "database", "viewer"), 1.0);
        assert_eq!(metrics.queue_size(), 4.0);
        assert_eq!(metrics.queue_wait_samples("network", 3), 1);
        assert_eq!(metrics.queue_wait_samples("network", 1), 0);
    }

    #[test]
    fn test_text_exposition() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record(&started("operator"));
        metrics.record(&ended(ProcessState::Completed, 1500));
        let mut by_role = BTreeMap::new();
        by_role.insert("operator".to_string(), 2);
        metrics.set_connections(&by_role);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("# TYPE ipc_process_duration_seconds histogram"));
        let bucket = text
            .lines()
            .filter(|l| l.starts_with("ipc_process_duration_seconds_bucket"))
            .find(|l| l.contains("le=\"2\""))
            .unwrap();
        assert!(bucket.contains("state=\"completed\""));
        assert!(bucket.ends_with(" 1"));
        assert!(text.contains("# TYPE ipc_active_processes gauge"));
        assert!(text.contains("ipc_connections_current{role=\"operator\"} 2"));
        assert!(CONTENT_TYPE.starts_with("text/plain"));

        metrics.set_connections(&BTreeMap::new());
        let text = metrics.encode_text().unwrap();
        assert!(!text.contains("ipc_connections_current{role=\"operator\"}"));
    }

    #[test]
    fn test_truncate_label() {
        assert_eq!(truncate_label("admin"), "admin");
        let long = "ñ".repeat(40);
        let cut = truncate_label(&long);
        assert!(cut.len() <= MAX_LABEL_VALUE_LEN);
        assert!(long.starts_with(cut));
    }

    #[tokio::test]
    async fn test_run_consumes_channel_until_shutdown() {
        let (tx, rx) = broadcast::channel(16);
        let metrics = MetricsCollector::new().unwrap();
        let shutdown = metrics.shutdown_handle();
        let handle = tokio::spawn(metrics.clone().run(rx));

        tx.send(SchedulerEvent::QueueSample { size: 7 }).unwrap();
        while metrics.queue_size() != 7.0 {
            tokio::task::yield_now().await;
        }

        shutdown.notify_one();
        handle.await.unwrap();
    }
}
