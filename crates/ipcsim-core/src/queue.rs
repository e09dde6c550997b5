// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded FIFO queue of admitted actions waiting for a free slot.
//!
//! The queue never blocks: a full queue rejects the entry and counts it as
//! discarded. Dequeue order is strictly insertion order; `priority` is
//! carried along but does not reorder entries.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::Action;
use crate::lifecycle::ProcessOutcome;

/// An action waiting in a [`BoundedQueue`].
#[derive(Debug)]
pub struct QueueEntry {
    /// Queue-local id.
    pub id: Uuid,
    /// When the entry was accepted.
    pub enqueued_at: Instant,
    /// The admitted action.
    pub action: Action,
    /// Submitting owner.
    pub owner: String,
    /// Role at submission time; re-checked when the entry is popped.
    pub role: String,
    pub(crate) reply: Option<oneshot::Sender<ProcessOutcome>>,
}

impl QueueEntry {
    /// Create an entry stamped with the current time.
    pub fn new(action: Action, owner: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            enqueued_at: Instant::now(),
            action,
            owner: owner.into(),
            role: role.into(),
            reply: None,
        }
    }

    pub(crate) fn with_reply(mut self, reply: oneshot::Sender<ProcessOutcome>) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Time spent in the queue so far.
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Deliver the final outcome to the submitter, if anyone is waiting.
    pub(crate) fn resolve(&mut self, outcome: ProcessOutcome) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(outcome);
        }
    }
}

/// Why an entry was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueRejection {
    /// The queue is at capacity.
    #[error("queue full")]
    Full,
    /// The entry failed structural validation.
    #[error("invalid action")]
    Invalid,
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Entries currently waiting.
    pub current_size: usize,
    /// Capacity.
    pub max_size: usize,
    /// `current_size / max_size` as a percentage.
    pub utilization_percent: f64,
    /// Entries handed out by `dequeue`.
    pub total_processed: u64,
    /// Entries rejected as full or invalid.
    #[serde(rename = "discardedActions")]
    pub discarded: u64,
    /// Mean wait of the entries currently queued.
    #[serde(rename = "averageWaitTime")]
    pub average_wait_ms: f64,
    /// Wait of the head entry.
    #[serde(rename = "oldestAction")]
    pub oldest_wait_ms: u64,
    /// Time since the queue was created.
    #[serde(rename = "queueAge")]
    pub queue_age_ms: u64,
    /// Dequeues per second over the queue's lifetime.
    pub throughput_rate: f64,
    /// Discards per second over the queue's lifetime.
    pub discard_rate: f64,
}

impl QueueStats {
    /// Fold another queue's statistics into this one.
    ///
    /// Sizes and counters add up; the wait average is weighted by size and
    /// age-based values keep the maximum.
    pub fn merge(&mut self, other: &QueueStats) {
        let combined = self.current_size + other.current_size;
        if combined > 0 {
            self.average_wait_ms = (self.average_wait_ms * self.current_size as f64
                + other.average_wait_ms * other.current_size as f64)
                / combined as f64;
        }
        self.current_size = combined;
        self.max_size += other.max_size;
        self.utilization_percent = percent(self.current_size, self.max_size);
        self.total_processed += other.total_processed;
        self.discarded += other.discarded;
        self.oldest_wait_ms = self.oldest_wait_ms.max(other.oldest_wait_ms);
        self.queue_age_ms = self.queue_age_ms.max(other.queue_age_ms);
        self.throughput_rate += other.throughput_rate;
        self.discard_rate += other.discard_rate;
    }
}

/// FIFO queue with a hard capacity.
#[derive(Debug)]
pub struct BoundedQueue {
    entries: VecDeque<QueueEntry>,
    max_size: usize,
    total_processed: u64,
    discarded: u64,
    created_at: Instant,
}

impl BoundedQueue {
    /// Create an empty queue holding at most `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size,
            total_processed: 0,
            discarded: 0,
            created_at: Instant::now(),
        }
    }

    /// Append `entry`, returning a reference to the stored entry.
    ///
    /// A rejected entry is counted as discarded and dropped.
    pub fn try_enqueue(&mut self, entry: QueueEntry) -> Result<&QueueEntry, QueueRejection> {
        if self.entries.len() >= self.max_size {
            self.discarded += 1;
            warn!(
                owner = %entry.owner,
                queue_size = self.entries.len(),
                max_size = self.max_size,
                discarded_total = self.discarded,
                "Queue full, action discarded"
            );
            return Err(QueueRejection::Full);
        }

        if let Err(e) = entry.action.validate() {
            self.discarded += 1;
            warn!(owner = %entry.owner, error = %e, "Invalid action discarded");
            return Err(QueueRejection::Invalid);
        }

        info!(
            entry_id = %entry.id,
            owner = %entry.owner,
            action_type = %entry.action.action_type,
            queue_size = self.entries.len() + 1,
            "Action queued"
        );
        self.entries.push_back(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Append `entry`. Returns false if it was rejected.
    pub fn enqueue(&mut self, entry: QueueEntry) -> bool {
        self.try_enqueue(entry).is_ok()
    }

    /// Remove and return the oldest entry.
    pub fn dequeue(&mut self) -> Option<QueueEntry> {
        let entry = self.entries.pop_front()?;
        self.total_processed += 1;
        debug!(
            entry_id = %entry.id,
            wait_ms = entry.waited().as_millis() as u64,
            remaining = self.entries.len(),
            "Action dequeued"
        );
        Some(entry)
    }

    /// The oldest entry, without removing it.
    pub fn peek(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    /// Remove every entry, returning them in FIFO order.
    pub fn clear(&mut self) -> Vec<QueueEntry> {
        let cleared: Vec<QueueEntry> = self.entries.drain(..).collect();
        if !cleared.is_empty() {
            info!(cleared = cleared.len(), "Queue cleared");
        }
        cleared
    }

    /// Drop entries that waited longer than `max_age`. Returns how many were removed.
    pub fn prune(&mut self, max_age: Duration) -> usize {
        self.prune_expired(max_age).len()
    }

    /// Remove and return entries that waited longer than `max_age`.
    pub(crate) fn prune_expired(&mut self, max_age: Duration) -> Vec<QueueEntry> {
        let now = Instant::now();
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|entry| now.duration_since(entry.enqueued_at) > max_age);
        self.entries = kept.into();

        if !expired.is_empty() {
            info!(
                pruned = expired.len(),
                remaining = self.entries.len(),
                "Expired actions pruned"
            );
        }
        expired
    }

    /// Number of waiting entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Capacity.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Entries rejected so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Current statistics.
    pub fn stats(&self) -> QueueStats {
        let now = Instant::now();
        let age = now.duration_since(self.created_at);
        let age_secs = age.as_secs_f64();

        let average_wait_ms = if self.entries.is_empty() {
            0.0
        } else {
            let total: f64 = self
                .entries
                .iter()
                .map(|e| now.duration_since(e.enqueued_at).as_secs_f64() * 1000.0)
                .sum();
            total / self.entries.len() as f64
        };

        QueueStats {
            current_size: self.entries.len(),
            max_size: self.max_size,
            utilization_percent: percent(self.entries.len(), self.max_size),
            total_processed: self.total_processed,
            discarded: self.discarded,
            average_wait_ms,
            oldest_wait_ms: self
                .entries
                .front()
                .map_or(0, |e| now.duration_since(e.enqueued_at).as_millis() as u64),
            queue_age_ms: age.as_millis() as u64,
            throughput_rate: rate(self.total_processed, age_secs),
            discard_rate: rate(self.discarded, age_secs),
        }
    }
}

fn percent(size: usize, max: usize) -> f64 {
    if max == 0 {
        0.0
    } else {
        size as f64 / max as f64 * 100.0
    }
}

fn rate(count: u64, secs: f64) -> f64 {
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}
