// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process lifecycle: drives one process from PENDING to a terminal state.
//!
//! Each attempt runs the [`Workload`] while a poll timer fires every
//! `check_interval`. Both the poll tick and the work completion check the
//! process's cancellation token, so an interrupt that lands before the next
//! resumption always wins over a coinciding completion or failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::ProcessType;
use crate::config::ProcessConfig;
use crate::error::{CoreError, Result};
use crate::events::{EventSink, SchedulerEvent};
use crate::process::{Process, ProcessState};
use crate::registry::ProcessRegistry;

/// Error of a single work attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkloadError {
    /// Injected failure of the simulated workload.
    #[error("Simulated failure in {0} process")]
    Simulated(ProcessType),

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

/// The work a RUNNING process performs.
///
/// Implementations must tolerate being dropped mid-await: an interrupted
/// attempt is abandoned, not awaited to completion.
#[async_trait]
pub trait Workload: Send + Sync {
    /// Run one attempt for `process` and return its result payload.
    async fn run(&self, process: &Process) -> std::result::Result<Value, WorkloadError>;
}

/// Sleeps for a random duration and optionally fails.
#[derive(Debug, Clone)]
pub struct SimulatedWorkload {
    min_duration: Duration,
    max_duration: Duration,
    failure_rate: f64,
}

impl SimulatedWorkload {
    /// Workload drawing durations uniformly from `[min_duration, max_duration]`.
    pub fn new(min_duration: Duration, max_duration: Duration) -> Self {
        Self {
            min_duration,
            max_duration: max_duration.max(min_duration),
            failure_rate: 0.0,
        }
    }

    /// Build from process settings.
    pub fn from_config(config: &ProcessConfig) -> Self {
        Self::new(config.min_duration, config.max_duration).with_failure_rate(config.failure_rate)
    }

    /// Probability in `[0, 1]` that an attempt fails.
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    fn draw(&self) -> (Duration, bool) {
        let mut rng = rand::thread_rng();
        let duration = if self.max_duration > self.min_duration {
            rng.gen_range(self.min_duration..=self.max_duration)
        } else {
            self.min_duration
        };
        let fail = self.failure_rate > 0.0 && rng.gen_bool(self.failure_rate);
        (duration, fail)
    }
}

#[async_trait]
impl Workload for SimulatedWorkload {
    async fn run(&self, process: &Process) -> std::result::Result<Value, WorkloadError> {
        let (duration, fail) = self.draw();
        debug!(
            process_id = %process.id,
            duration_ms = duration.as_millis() as u64,
            "Simulating work"
        );
        tokio::time::sleep(duration).await;

        if fail {
            return Err(WorkloadError::Simulated(process.process_type));
        }
        Ok(json!({
            "status": "completed",
            "processType": process.process_type,
            "result": process.data,
        }))
    }
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The work finished.
    Completed {
        /// Process id.
        process_id: String,
        /// Workload result.
        result: Value,
    },
    /// Every attempt failed.
    Failed {
        /// Process id.
        process_id: String,
        /// Error of the last attempt.
        error: String,
        /// Retries consumed.
        retries: u32,
    },
    /// An interrupt was observed.
    Interrupted {
        /// Process id.
        process_id: String,
    },
    /// The action left the queue without ever starting.
    Dropped {
        /// Why it was dropped.
        reason: DropReason,
    },
}

impl ProcessOutcome {
    /// Id of the process, if one was created.
    pub fn process_id(&self) -> Option<&str> {
        match self {
            Self::Completed { process_id, .. }
            | Self::Failed { process_id, .. }
            | Self::Interrupted { process_id } => Some(process_id),
            Self::Dropped { .. } => None,
        }
    }

    /// Whether the process completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Why a queued action was dropped before starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// It waited longer than the queue's maximum age.
    Expired,
    /// Its role no longer admits it.
    Forbidden,
    /// Its owner disconnected.
    OwnerReleased,
    /// The scheduler shut down.
    Shutdown,
    /// Creating or starting the process failed.
    StartFailed,
}

impl DropReason {
    /// Human readable reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Expired => "expired in queue",
            DropReason::Forbidden => "forbidden",
            DropReason::OwnerReleased => "owner released",
            DropReason::Shutdown => "scheduler shut down",
            DropReason::StartFailed => "failed to start",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Attempt {
    Completed(Value),
    Failed(String),
    Cancelled,
}

/// Drives processes through their state machine.
///
/// The task running [`ProcessLifecycle::execute`] for a process is the only
/// writer of that process's state once it is RUNNING.
#[derive(Clone)]
pub struct ProcessLifecycle {
    registry: Arc<ProcessRegistry>,
    workload: Arc<dyn Workload>,
    config: ProcessConfig,
    events: EventSink,
}

impl std::fmt::Debug for ProcessLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLifecycle")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProcessLifecycle {
    /// Create a lifecycle driver.
    pub fn new(
        registry: Arc<ProcessRegistry>,
        workload: Arc<dyn Workload>,
        config: ProcessConfig,
        events: EventSink,
    ) -> Self {
        Self {
            registry,
            workload,
            config,
            events,
        }
    }

    /// Registry this lifecycle writes to.
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Move a PENDING process to RUNNING and add it to the active set.
    pub fn start(&self, id: &str) -> Result<Process> {
        let process = self.registry.transition(id, |p| {
            p.mark_running(Utc::now())?;
            Ok(p.clone())
        })?;

        info!(
            process_id = %process.id,
            owner = %process.owner,
            role = %process.role,
            process_type = %process.process_type,
            "Process started"
        );
        self.events.emit(SchedulerEvent::ProcessStarted {
            process_id: process.id.clone(),
            owner: process.owner.clone(),
            role: process.role.clone(),
            process_type: process.process_type,
        });
        Ok(process)
    }

    /// Start a PENDING process and run it to a terminal state.
    pub async fn run(&self, id: &str) -> Result<ProcessOutcome> {
        self.start(id)?;
        self.execute(id).await
    }

    /// Run a RUNNING process to a terminal state.
    pub async fn execute(&self, id: &str) -> Result<ProcessOutcome> {
        let cancel = self
            .registry
            .cancel_token(id)
            .ok_or_else(|| CoreError::ProcessNotFound {
                process_id: id.to_string(),
            })?;

        loop {
            let snapshot = self.registry.get(id).ok_or_else(|| CoreError::ProcessNotFound {
                process_id: id.to_string(),
            })?;

            match self.attempt(&snapshot, &cancel).await {
                Attempt::Completed(result) => {
                    let process = self.finish(id, ProcessState::Completed, None)?;
                    if process.state == ProcessState::Interrupted {
                        return Ok(interrupted(id));
                    }
                    info!(process_id = %id, retries = process.retries, "Process completed");
                    return Ok(ProcessOutcome::Completed {
                        process_id: id.to_string(),
                        result,
                    });
                }
                Attempt::Cancelled => {
                    self.finish(id, ProcessState::Interrupted, None)?;
                    return Ok(interrupted(id));
                }
                Attempt::Failed(error) if snapshot.retries < self.config.max_retries => {
                    let retries = self.registry.transition(id, |p| {
                        p.mark_retry()?;
                        Ok(p.retries)
                    })?;
                    warn!(
                        process_id = %id,
                        retries,
                        max_retries = self.config.max_retries,
                        error = %error,
                        "Process attempt failed, retrying"
                    );
                    self.events.emit(SchedulerEvent::ProcessRetried {
                        process_id: id.to_string(),
                        retries,
                        error,
                    });
                }
                Attempt::Failed(error) => {
                    let process = self.finish(id, ProcessState::Failed, Some(error.clone()))?;
                    if process.state == ProcessState::Interrupted {
                        return Ok(interrupted(id));
                    }
                    warn!(
                        process_id = %id,
                        retries = process.retries,
                        error = %error,
                        "Process failed"
                    );
                    return Ok(ProcessOutcome::Failed {
                        process_id: id.to_string(),
                        error,
                        retries: process.retries,
                    });
                }
            }
        }
    }

    /// Request cancellation of a RUNNING process.
    ///
    /// Returns false when the process is unknown or not in the active set.
    /// The process reaches INTERRUPTED at its next poll or completion.
    pub fn interrupt(&self, id: &str) -> bool {
        if !self.registry.is_active(id) {
            return false;
        }
        let requested = self.registry.request_cancel(id);
        if requested {
            info!(process_id = %id, "Interrupt requested");
        }
        requested
    }

    async fn attempt(&self, process: &Process, cancel: &CancellationToken) -> Attempt {
        let period = self.config.check_interval;
        let mut poll = tokio::time::interval_at(Instant::now() + period, period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let work = self.workload.run(process);
        tokio::pin!(work);

        loop {
            tokio::select! {
                biased;

                _ = poll.tick() => {
                    if cancel.is_cancelled() {
                        return Attempt::Cancelled;
                    }
                }
                result = &mut work => {
                    if cancel.is_cancelled() {
                        return Attempt::Cancelled;
                    }
                    return match result {
                        Ok(value) => Attempt::Completed(value),
                        Err(e) => Attempt::Failed(e.to_string()),
                    };
                }
            }
        }
    }

    /// Move a RUNNING process to `state`.
    ///
    /// An interrupt accepted after the last cancellation check still wins: the
    /// flag is read under the same entry lock `request_cancel` writes it under,
    /// so an accepted interrupt always ends the process INTERRUPTED.
    fn finish(&self, id: &str, state: ProcessState, error: Option<String>) -> Result<Process> {
        let process = self.registry.transition(id, |p| {
            if p.cancel_requested {
                p.finish(ProcessState::Interrupted, Utc::now(), None)?;
            } else {
                p.finish(state, Utc::now(), error)?;
            }
            Ok(p.clone())
        })?;

        let duration = process
            .duration()
            .and_then(|d| d.to_std().ok())
            .unwrap_or_default();
        self.events.emit(SchedulerEvent::ProcessEnded {
            process_id: process.id.clone(),
            role: process.role.clone(),
            process_type: process.process_type,
            state: process.state,
            duration,
        });
        Ok(process)
    }
}

fn interrupted(id: &str) -> ProcessOutcome {
    info!(process_id = %id, "Process interrupted");
    ProcessOutcome::Interrupted {
        process_id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionType};
    use crate::process::ProcessSpec;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Workload with a fixed duration and a scripted number of failures.
    struct ScriptedWorkload {
        duration: Duration,
        failures: u32,
        calls: AtomicU32,
    }

    impl ScriptedWorkload {
        fn new(duration: Duration, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                duration,
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Workload for ScriptedWorkload {
        async fn run(&self, _process: &Process) -> std::result::Result<Value, WorkloadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.duration).await;
            if call < self.failures {
                Err(WorkloadError::Other(format!("attempt {} failed", call + 1)))
            } else {
                Ok(json!({ "attempt": call + 1 }))
            }
        }
    }

    fn config(max_retries: u32) -> ProcessConfig {
        ProcessConfig {
            min_duration: Duration::from_millis(500),
            max_duration: Duration::from_millis(500),
            check_interval: Duration::from_millis(100),
            max_retries,
            failure_rate: 0.0,
        }
    }

    fn setup(workload: Arc<dyn Workload>, max_retries: u32) -> (ProcessLifecycle, EventSink) {
        let registry = Arc::new(ProcessRegistry::new());
        registry
            .create(
                "p-1",
                ProcessSpec::from_action(
                    Action::new(ActionType::Solicitud, ProcessType::Database),
                    "conn-1",
                    "operator",
                ),
            )
            .unwrap();
        let events = EventSink::new(64);
        (
            ProcessLifecycle::new(registry, workload, config(max_retries), events.clone()),
            events,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_completes_with_result() {
        let (lifecycle, _) = setup(ScriptedWorkload::new(Duration::from_millis(450), 0), 3);

        let outcome = lifecycle.run("p-1").await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Completed {
                process_id: "p-1".to_string(),
                result: json!({ "attempt": 1 }),
            }
        );

        let process = lifecycle.registry().get("p-1").unwrap();
        assert_eq!(process.state, ProcessState::Completed);
        assert!(process.end_time.is_some());
        assert!(!lifecycle.registry().is_active("p-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_work_fails_after_max_retries_plus_one_attempts() {
        let workload = ScriptedWorkload::new(Duration::from_millis(50), u32::MAX);
        let (lifecycle, events) = setup(workload.clone(), 3);
        let mut rx = events.subscribe();

        let outcome = lifecycle.run("p-1").await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Failed {
                process_id: "p-1".to_string(),
                error: "attempt 4 failed".to_string(),
                retries: 3,
            }
        );
        assert_eq!(workload.calls.load(Ordering::SeqCst), 4);

        let process = lifecycle.registry().get("p-1").unwrap();
        assert_eq!(process.state, ProcessState::Failed);
        assert_eq!(process.retries, 3);
        assert_eq!(process.error.as_deref(), Some("attempt 4 failed"));

        let mut retried = 0;
        let mut ended = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                SchedulerEvent::ProcessRetried { .. } => retried += 1,
                SchedulerEvent::ProcessEnded { state, .. } => {
                    assert_eq!(state, ProcessState::Failed);
                    ended += 1;
                }
                _ => {}
            }
        }
        assert_eq!((retried, ended), (3, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_transparently() {
        let workload = ScriptedWorkload::new(Duration::from_millis(50), 2);
        let (lifecycle, _) = setup(workload.clone(), 3);

        let outcome = lifecycle.run("p-1").await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(workload.calls.load(Ordering::SeqCst), 3);

        let process = lifecycle.registry().get("p-1").unwrap();
        assert_eq!(process.retries, 2);
        assert!(process.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_before_poll_wins_over_completion() {
        // Work finishes at 50ms, well before the first poll at 100ms.
        let (lifecycle, _) = setup(ScriptedWorkload::new(Duration::from_millis(50), 0), 3);
        lifecycle.start("p-1").unwrap();
        assert!(lifecycle.interrupt("p-1"));

        let outcome = lifecycle.execute("p-1").await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Interrupted {
                process_id: "p-1".to_string()
            }
        );
        let process = lifecycle.registry().get("p-1").unwrap();
        assert_eq!(process.state, ProcessState::Interrupted);
        assert!(process.cancel_requested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_after_last_check_ends_interrupted() {
        let (lifecycle, events) = setup(ScriptedWorkload::new(Duration::from_millis(10), 0), 3);
        let mut rx = events.subscribe();
        lifecycle.start("p-1").unwrap();

        // The work already returned; the interrupt lands before the final transition.
        assert!(lifecycle.interrupt("p-1"));
        let process = lifecycle.finish("p-1", ProcessState::Completed, None).unwrap();

        assert_eq!(process.state, ProcessState::Interrupted);
        assert!(process.cancel_requested);
        assert!(!lifecycle.registry().is_active("p-1"));
        assert!(!lifecycle.interrupt("p-1"));

        let mut ended = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SchedulerEvent::ProcessEnded { state, .. } = event {
                ended.push(state);
            }
        }
        assert_eq!(ended, vec![ProcessState::Interrupted]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_interrupt_ends_interrupted() {
        let (lifecycle, _) = setup(ScriptedWorkload::new(Duration::from_millis(10), 0), 3);
        lifecycle.start("p-1").unwrap();
        assert!(lifecycle.interrupt("p-1"));

        let process = lifecycle
            .finish("p-1", ProcessState::Failed, Some("boom".to_string()))
            .unwrap();
        assert_eq!(process.state, ProcessState::Interrupted);
        assert!(process.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_is_observed_at_next_poll() {
        let (lifecycle, _) = setup(ScriptedWorkload::new(Duration::from_secs(60), 0), 3);
        lifecycle.start("p-1").unwrap();

        let runner = lifecycle.clone();
        let handle = tokio::spawn(async move { runner.execute("p-1").await });

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(lifecycle.interrupt("p-1"));
        let started = Instant::now();

        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Interrupted { .. }));
        assert!(started.elapsed() <= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_requires_running_process() {
        let (lifecycle, _) = setup(ScriptedWorkload::new(Duration::from_millis(10), 0), 3);
        assert!(!lifecycle.interrupt("p-1"));
        assert!(!lifecycle.interrupt("unknown"));

        lifecycle.run("p-1").await.unwrap();
        assert!(!lifecycle.interrupt("p-1"));
        assert_eq!(
            lifecycle.registry().get("p-1").unwrap().state,
            ProcessState::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_rejected() {
        let (lifecycle, events) = setup(ScriptedWorkload::new(Duration::from_millis(10), 0), 3);
        let mut rx = events.subscribe();

        lifecycle.start("p-1").unwrap();
        let err = lifecycle.start("p-1").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TRANSITION");

        assert!(matches!(
            rx.try_recv().unwrap(),
            SchedulerEvent::ProcessStarted { .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_workload_stays_within_bounds() {
        let workload =
            SimulatedWorkload::new(Duration::from_millis(100), Duration::from_millis(300));
        let process = Process::new(
            "p-1",
            ProcessSpec::from_action(
                Action::new(ActionType::Consulta, ProcessType::Analysis),
                "conn-1",
                "viewer",
            ),
        );

        for _ in 0..20 {
            let started = Instant::now();
            let value = workload.run(&process).await.unwrap();
            let elapsed = started.elapsed();
            assert!(elapsed >= Duration::from_millis(100));
            assert!(elapsed <= Duration::from_millis(301));
            assert_eq!(value["status"], "completed");
            assert_eq!(value["processType"], "analysis");
        }

        let failing = SimulatedWorkload::new(Duration::ZERO, Duration::ZERO).with_failure_rate(1.0);
        assert_eq!(
            failing.run(&process).await.unwrap_err(),
            WorkloadError::Simulated(ProcessType::Analysis)
        );
    }
}
