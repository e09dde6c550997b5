// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission and dispatch of actions.
//!
//! [`Dispatcher::submit`] runs the permission gate, then either starts a
//! process immediately or parks the action in its owner's
//! [`BoundedQueue`]. Whenever a process of an owner reaches a terminal state
//! the owner's queue is drained while the owner is below its concurrency
//! limit; each popped entry is re-admitted against the permission table in
//! force at that moment.
//!
//! Slots are claimed under the dispatcher lock: creating and starting a
//! process happen in the same critical section as the capacity check, so a
//! single free slot never yields two starts.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::action::Action;
use crate::config::SchedulerConfig;
use crate::error::CoreError;
use crate::events::{EventSink, SchedulerEvent};
use crate::lifecycle::{DropReason, ProcessLifecycle, ProcessOutcome, Workload};
use crate::permission::{PermissionGate, PermissionTable};
use crate::process::{ProcessSpec, generate_process_id};
use crate::queue::{BoundedQueue, QueueEntry, QueueRejection, QueueStats};
use crate::registry::ProcessRegistry;

/// Why a submission was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Denial {
    /// The role may not run this action or process type.
    #[error("forbidden")]
    Forbidden,
    /// The owner is at its limit and its queue is full.
    #[error("queue full")]
    QueueFull,
    /// The action failed structural validation.
    #[error("invalid action: {0}")]
    Invalid(String),
    /// The dispatcher no longer accepts work.
    #[error("scheduler shut down")]
    ShuttingDown,
    /// The process could not be created or started.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl Denial {
    /// Short reason used for metrics labels.
    pub fn reason(&self) -> &'static str {
        match self {
            Denial::Forbidden => "forbidden",
            Denial::QueueFull => "queue full",
            Denial::Invalid(_) => "invalid",
            Denial::ShuttingDown => "shutdown",
            Denial::Core(_) => "internal",
        }
    }
}

/// Resolves to the final [`ProcessOutcome`] of a submission.
#[derive(Debug)]
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion {
    rx: oneshot::Receiver<ProcessOutcome>,
}

impl Future for Completion {
    type Output = ProcessOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|outcome| {
            outcome.unwrap_or(ProcessOutcome::Dropped {
                reason: DropReason::Shutdown,
            })
        })
    }
}

/// An accepted submission.
#[derive(Debug)]
pub enum Submission {
    /// A process was created and is RUNNING.
    Started {
        /// The new process id.
        process_id: String,
        /// Final outcome.
        completion: Completion,
    },
    /// The action waits in the owner's queue.
    Queued {
        /// Queue entry id.
        entry_id: Uuid,
        /// Final outcome.
        completion: Completion,
    },
}

impl Submission {
    /// Process id, for submissions that started right away.
    pub fn process_id(&self) -> Option<&str> {
        match self {
            Submission::Started { process_id, .. } => Some(process_id),
            Submission::Queued { .. } => None,
        }
    }

    /// Whether the action was queued.
    pub fn is_queued(&self) -> bool {
        matches!(self, Submission::Queued { .. })
    }

    /// The future resolving to the final outcome.
    pub fn into_completion(self) -> Completion {
        match self {
            Submission::Started { completion, .. } | Submission::Queued { completion, .. } => {
                completion
            }
        }
    }
}

/// Result of an interrupt request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// Cancellation was requested; the process ends INTERRUPTED.
    Interrupted,
    /// No such process, or it already ended.
    NotFound,
    /// The requester may not interrupt this process.
    Forbidden,
}

/// What [`Dispatcher::release_owner`] cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    /// Running processes that were interrupted.
    pub interrupted: usize,
    /// Queued entries that were dropped.
    pub dropped: usize,
}

struct DispatchState {
    gate: PermissionGate,
    queues: HashMap<String, BoundedQueue>,
    closed: bool,
}

impl DispatchState {
    fn queued(&self) -> usize {
        self.queues.values().map(BoundedQueue::len).sum()
    }
}

struct Inner {
    state: Mutex<DispatchState>,
    registry: Arc<ProcessRegistry>,
    lifecycle: ProcessLifecycle,
    events: EventSink,
    config: SchedulerConfig,
}

/// Admission front door of the scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher with its own registry and event channel.
    pub fn new(
        permissions: PermissionTable,
        workload: Arc<dyn Workload>,
        config: SchedulerConfig,
    ) -> Self {
        Self::with_parts(
            permissions,
            workload,
            config,
            Arc::new(ProcessRegistry::new()),
            EventSink::default(),
        )
    }

    /// Create a dispatcher over an existing registry and event sink.
    pub fn with_parts(
        permissions: PermissionTable,
        workload: Arc<dyn Workload>,
        config: SchedulerConfig,
        registry: Arc<ProcessRegistry>,
        events: EventSink,
    ) -> Self {
        let lifecycle = ProcessLifecycle::new(
            registry.clone(),
            workload,
            config.process.clone(),
            events.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(DispatchState {
                    gate: PermissionGate::new(Arc::new(permissions)),
                    queues: HashMap::new(),
                    closed: false,
                }),
                registry,
                lifecycle,
                events,
                config,
            }),
        }
    }

    /// Submit `action` on behalf of `owner` acting as `role`.
    pub async fn submit(
        &self,
        owner: &str,
        role: &str,
        action: Action,
    ) -> Result<Submission, Denial> {
        if let Err(e) = action.validate() {
            return Err(self.deny(owner, role, &action, Denial::Invalid(e.to_string())));
        }

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        if state.closed {
            return Err(self.deny(owner, role, &action, Denial::ShuttingDown));
        }
        if !state
            .gate
            .admit(role, action.action_type, action.process_type)
        {
            return Err(self.deny(owner, role, &action, Denial::Forbidden));
        }

        let limit = state.gate.max_concurrent(role).unwrap_or(0);
        let queue_empty = state.queues.get(owner).is_none_or(BoundedQueue::is_empty);
        let (tx, rx) = oneshot::channel();
        let completion = Completion { rx };

        if queue_empty && self.inner.registry.active_count_for(owner) < limit {
            let spec = ProcessSpec::from_action(action, owner, role);
            let process_id = self.launch(spec, Some(tx))?;
            return Ok(Submission::Started {
                process_id,
                completion,
            });
        }

        let queue = state
            .queues
            .entry(owner.to_string())
            .or_insert_with(|| BoundedQueue::new(self.inner.config.queue.max_size));
        let entry = QueueEntry::new(action.clone(), owner, role).with_reply(tx);

        match queue.try_enqueue(entry) {
            Ok(entry) => {
                let entry_id = entry.id;
                self.inner.events.emit(SchedulerEvent::ActionQueued {
                    owner: owner.to_string(),
                    entry_id,
                    process_type: action.process_type,
                });
                self.inner.events.emit(SchedulerEvent::QueueSample {
                    size: state.queued(),
                });
                Ok(Submission::Queued {
                    entry_id,
                    completion,
                })
            }
            Err(QueueRejection::Full) => Err(self.deny(owner, role, &action, Denial::QueueFull)),
            Err(QueueRejection::Invalid) => Err(self.deny(
                owner,
                role,
                &action,
                Denial::Invalid("rejected by queue".to_string()),
            )),
        }
    }

    /// Promote queued entries of `owner` into free slots.
    ///
    /// Called automatically after each process of `owner` ends.
    pub async fn on_completion(&self, owner: &str) {
        let mut guard = self.inner.state.lock().await;
        self.drain(&mut guard, owner);
    }

    /// Interrupt `process_id` on behalf of `requester` acting as `role`.
    ///
    /// Allowed for the process owner and for roles with `can_interrupt`.
    pub async fn interrupt(
        &self,
        requester: &str,
        role: &str,
        process_id: &str,
    ) -> InterruptOutcome {
        let Some(process) = self.inner.registry.get(process_id) else {
            return InterruptOutcome::NotFound;
        };
        if process.is_terminal() {
            return InterruptOutcome::NotFound;
        }

        let allowed = process.owner == requester || self.permissions().await.can_interrupt(role);
        if !allowed {
            warn!(
                process_id = %process_id,
                requester = %requester,
                role = %role,
                "Interrupt refused"
            );
            return InterruptOutcome::Forbidden;
        }

        if self.inner.lifecycle.interrupt(process_id) {
            InterruptOutcome::Interrupted
        } else {
            InterruptOutcome::NotFound
        }
    }

    /// Forget everything `owner` has in flight: interrupt its running
    /// processes and drop its queued entries.
    pub async fn release_owner(&self, owner: &str) -> ReleaseSummary {
        let (mut entries, queued) = {
            let mut state = self.inner.state.lock().await;
            let entries = state
                .queues
                .remove(owner)
                .map(|mut queue| queue.clear())
                .unwrap_or_default();
            (entries, state.queued())
        };

        let dropped = entries.len();
        for entry in &mut entries {
            entry.resolve(ProcessOutcome::Dropped {
                reason: DropReason::OwnerReleased,
            });
        }

        let interrupted = self
            .inner
            .registry
            .active_ids_for(owner)
            .iter()
            .filter(|id| self.inner.lifecycle.interrupt(id))
            .count();

        if dropped > 0 {
            self.inner
                .events
                .emit(SchedulerEvent::QueueSample { size: queued });
        }
        info!(owner = %owner, interrupted, dropped, "Owner released");
        ReleaseSummary {
            interrupted,
            dropped,
        }
    }

    /// Drop queued entries older than `max_age`. Returns how many were dropped.
    pub async fn prune_queues(&self, max_age: Duration) -> usize {
        let (mut expired, queued) = {
            let mut state = self.inner.state.lock().await;
            let expired: Vec<QueueEntry> = state
                .queues
                .values_mut()
                .flat_map(|queue| queue.prune_expired(max_age))
                .collect();
            (expired, state.queued())
        };

        for entry in &mut expired {
            entry.resolve(ProcessOutcome::Dropped {
                reason: DropReason::Expired,
            });
        }
        if !expired.is_empty() {
            self.inner
                .events
                .emit(SchedulerEvent::QueueSample { size: queued });
        }
        expired.len()
    }

    /// Statistics of all owner queues combined.
    pub async fn queue_stats(&self) -> QueueStats {
        let state = self.inner.state.lock().await;
        let mut total = QueueStats::default();
        for queue in state.queues.values() {
            total.merge(&queue.stats());
        }
        total
    }

    /// Statistics of one owner's queue.
    pub async fn queue_stats_for(&self, owner: &str) -> Option<QueueStats> {
        let state = self.inner.state.lock().await;
        state.queues.get(owner).map(BoundedQueue::stats)
    }

    /// Entries waiting across all owners.
    pub async fn queued_len(&self) -> usize {
        self.inner.state.lock().await.queued()
    }

    /// Swap the permission table. Queued entries are re-admitted against the
    /// new table, and owners whose cap grew get their queues drained.
    pub async fn replace_permissions(&self, table: PermissionTable) {
        let mut guard = self.inner.state.lock().await;
        guard.gate = PermissionGate::new(Arc::new(table));
        let owners: Vec<String> = guard.queues.keys().cloned().collect();
        for owner in owners {
            self.drain(&mut guard, &owner);
        }
        info!("Permission table replaced");
    }

    /// Current permission gate.
    pub async fn permissions(&self) -> PermissionGate {
        self.inner.state.lock().await.gate.clone()
    }

    /// Stop accepting work, drop every queued entry and interrupt every
    /// running process. Returns the number of interrupted processes.
    pub async fn shutdown(&self) -> usize {
        let mut entries = {
            let mut state = self.inner.state.lock().await;
            state.closed = true;
            state
                .queues
                .drain()
                .flat_map(|(_, mut queue)| queue.clear())
                .collect::<Vec<_>>()
        };
        for entry in &mut entries {
            entry.resolve(ProcessOutcome::Dropped {
                reason: DropReason::Shutdown,
            });
        }

        let interrupted = self
            .inner
            .registry
            .active_processes()
            .iter()
            .filter(|p| self.inner.lifecycle.interrupt(&p.id))
            .count();
        info!(
            interrupted,
            dropped = entries.len(),
            "Dispatcher shut down"
        );
        interrupted
    }

    /// Subscribe to scheduler events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// The event sink shared with the lifecycle.
    pub fn events(&self) -> &EventSink {
        &self.inner.events
    }

    /// The process registry.
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.inner.registry
    }

    /// The configuration this dispatcher runs with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    fn drain(&self, state: &mut DispatchState, owner: &str) {
        let mut promoted = false;

        loop {
            let Some(queue) = state.queues.get_mut(owner) else {
                break;
            };
            let Some(head) = queue.peek() else {
                break;
            };

            if !state
                .gate
                .admit(&head.role, head.action.action_type, head.action.process_type)
            {
                if let Some(mut entry) = queue.dequeue() {
                    warn!(
                        entry_id = %entry.id,
                        owner = %owner,
                        role = %entry.role,
                        "Queued action no longer permitted, dropping"
                    );
                    self.deny(owner, &entry.role, &entry.action, Denial::Forbidden);
                    entry.resolve(ProcessOutcome::Dropped {
                        reason: DropReason::Forbidden,
                    });
                    promoted = true;
                }
                continue;
            }

            let limit = state.gate.max_concurrent(&head.role).unwrap_or(0);
            if self.inner.registry.active_count_for(owner) >= limit {
                break;
            }
            let Some(mut entry) = queue.dequeue() else {
                break;
            };
            promoted = true;

            let waited = entry.waited();
            self.inner.events.emit(SchedulerEvent::ActionDequeued {
                owner: owner.to_string(),
                process_type: entry.action.process_type,
                priority: entry.action.priority,
                waited,
            });
            let waited_ms = waited.as_millis() as u64;
            let reply = entry.reply.take();
            let spec = ProcessSpec::from_action(entry.action, owner, entry.role);
            match self.launch(spec, reply) {
                Ok(process_id) => {
                    info!(
                        process_id = %process_id,
                        owner = %owner,
                        waited_ms,
                        "Queued action promoted"
                    );
                }
                Err(e) => {
                    error!(owner = %owner, error = %e, "Failed to start queued action");
                }
            }
        }

        if promoted {
            self.inner.events.emit(SchedulerEvent::QueueSample {
                size: state.queued(),
            });
        }
    }

    /// Create and start a process, then hand it to a task that runs it to
    /// completion. Must be called with the dispatcher lock held.
    fn launch(
        &self,
        spec: ProcessSpec,
        reply: Option<oneshot::Sender<ProcessOutcome>>,
    ) -> Result<String, CoreError> {
        let owner = spec.owner.clone();
        let process_id = generate_process_id(&owner);

        let started = self
            .inner
            .registry
            .create(&process_id, spec)
            .and_then(|_| self.inner.lifecycle.start(&process_id));
        if let Err(e) = started {
            if let Some(reply) = reply {
                let _ = reply.send(ProcessOutcome::Dropped {
                    reason: DropReason::StartFailed,
                });
            }
            return Err(e);
        }

        let dispatcher = self.clone();
        let id = process_id.clone();
        tokio::spawn(async move {
            let outcome = match dispatcher.inner.lifecycle.execute(&id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(process_id = %id, error = %e, "Process execution aborted");
                    ProcessOutcome::Failed {
                        process_id: id.clone(),
                        error: e.to_string(),
                        retries: 0,
                    }
                }
            };

            // Promote the next queued entry before the submitter hears back.
            dispatcher.on_completion(&owner).await;
            if let Some(reply) = reply {
                let _ = reply.send(outcome);
            }
        });

        Ok(process_id)
    }

    fn deny(&self, owner: &str, role: &str, action: &Action, denial: Denial) -> Denial {
        warn!(
            owner = %owner,
            role = %role,
            action_type = %action.action_type,
            process_type = %action.process_type,
            reason = denial.reason(),
            "Action denied"
        );
        self.inner.events.emit(SchedulerEvent::ActionDenied {
            owner: owner.to_string(),
            role: role.to_string(),
            action_type: action.action_type,
            process_type: action.process_type,
            reason: denial.reason().to_string(),
        });
        denial
    }
}
