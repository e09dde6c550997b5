// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler notifications.
//!
//! Events are published on a broadcast channel. Publishing never fails and
//! never waits; with no subscribers the event is simply dropped.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::action::{ActionType, ProcessType};
use crate::process::ProcessState;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something observable happened inside the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A process entered RUNNING.
    ProcessStarted {
        /// Process id.
        process_id: String,
        /// Submitting owner.
        owner: String,
        /// Role at admission.
        role: String,
        /// Process kind.
        process_type: ProcessType,
    },
    /// A failed attempt is being retried.
    ProcessRetried {
        /// Process id.
        process_id: String,
        /// Retries consumed, including this one.
        retries: u32,
        /// Error of the failed attempt.
        error: String,
    },
    /// A process reached a terminal state.
    ProcessEnded {
        /// Process id.
        process_id: String,
        /// Role at admission.
        role: String,
        /// Process kind.
        process_type: ProcessType,
        /// Terminal state.
        state: ProcessState,
        /// Time spent running.
        duration: Duration,
    },
    /// An action was refused.
    ActionDenied {
        /// Submitting owner.
        owner: String,
        /// Role presented.
        role: String,
        /// Requested action kind.
        action_type: ActionType,
        /// Requested process kind.
        process_type: ProcessType,
        /// Denial reason on the wire (`forbidden`, `queue full`, ...).
        reason: String,
    },
    /// An action was parked in its owner's queue.
    ActionQueued {
        /// Submitting owner.
        owner: String,
        /// Queue entry id.
        entry_id: uuid::Uuid,
        /// Requested process kind.
        process_type: ProcessType,
    },
    /// A queued action left its queue to start a process.
    ActionDequeued {
        /// Submitting owner.
        owner: String,
        /// Requested process kind.
        process_type: ProcessType,
        /// Informational priority (1-5).
        priority: u8,
        /// Time spent queued.
        waited: Duration,
    },
    /// Total number of queued entries after a queue change.
    QueueSample {
        /// Entries waiting across all owners.
        size: usize,
    },
}

/// Cloneable publisher for [`SchedulerEvent`]s.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventSink {
    /// Create a sink with room for `capacity` unread events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event.
    pub fn emit(&self, event: SchedulerEvent) {
        // Err only means nobody is subscribed.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
