// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process registry.
//!
//! Owns every process ever created (until retention cleanup removes it) and
//! the active subset. The active subset is maintained by [`ProcessRegistry::transition`]:
//! after each write a process is in the active set iff it is RUNNING.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::process::{Process, ProcessSpec, ProcessState};

#[derive(Debug)]
struct ProcessSlot {
    process: Process,
    cancel: CancellationToken,
}

/// Indexed storage for all processes plus the active set.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: DashMap<String, ProcessSlot>,
    /// Running process id -> owner.
    active: DashMap<String, String>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a PENDING process. Fails if `id` is already registered.
    pub fn create(&self, id: &str, spec: ProcessSpec) -> Result<Process> {
        match self.processes.entry(id.to_string()) {
            Entry::Occupied(_) => Err(CoreError::ProcessAlreadyExists {
                process_id: id.to_string(),
            }),
            Entry::Vacant(vacant) => {
                let process = Process::new(id, spec);
                vacant.insert(ProcessSlot {
                    process: process.clone(),
                    cancel: CancellationToken::new(),
                });
                debug!(process_id = %id, "Process registered");
                Ok(process)
            }
        }
    }

    /// Snapshot of a process.
    pub fn get(&self, id: &str) -> Option<Process> {
        self.processes.get(id).map(|slot| slot.process.clone())
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.processes.contains_key(id)
    }

    /// Whether `id` is in the active set.
    pub fn is_active(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    /// Snapshots of all RUNNING processes.
    pub fn active_processes(&self) -> Vec<Process> {
        // Release the active-set guards before touching `processes`;
        // `transition` locks the two maps in the opposite order.
        let ids: Vec<String> = self.active.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Number of RUNNING processes owned by `owner`.
    pub fn active_count_for(&self, owner: &str) -> usize {
        self.active.iter().filter(|entry| entry.value() == owner).count()
    }

    /// Ids of RUNNING processes owned by `owner`.
    pub fn active_ids_for(&self, owner: &str) -> Vec<String> {
        self.active
            .iter()
            .filter(|entry| entry.value() == owner)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// All processes submitted by `owner`.
    pub fn by_owner(&self, owner: &str) -> Vec<Process> {
        self.collect(|p| p.owner == owner)
    }

    /// All processes in `state`.
    pub fn by_state(&self, state: ProcessState) -> Vec<Process> {
        self.collect(|p| p.state == state)
    }

    /// Number of processes per state, every state present.
    pub fn state_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts: BTreeMap<&'static str, usize> =
            ProcessState::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        for slot in self.processes.iter() {
            *counts.entry(slot.process.state.as_str()).or_default() += 1;
        }
        counts
    }

    /// Number of registered processes.
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Remove terminal processes that ended more than `retention` ago.
    ///
    /// Pending and running processes are never removed. Returns the number
    /// of processes removed.
    pub fn cleanup(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };
        self.cleanup_ended_before(cutoff)
    }

    /// Remove terminal processes whose end time is before `cutoff`.
    pub fn cleanup_ended_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.processes.retain(|_, slot| {
            let expired = slot.process.is_terminal()
                && slot.process.end_time.is_some_and(|end| end < cutoff);
            if expired {
                removed += 1;
            }
            !expired
        });
        removed
    }

    /// Apply a state change to one process and keep the active set in sync.
    pub(crate) fn transition<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Process) -> Result<T>,
    ) -> Result<T> {
        let mut slot = self
            .processes
            .get_mut(id)
            .ok_or_else(|| CoreError::ProcessNotFound {
                process_id: id.to_string(),
            })?;

        let result = f(&mut slot.process)?;

        if slot.process.state == ProcessState::Running {
            self.active
                .insert(slot.process.id.clone(), slot.process.owner.clone());
        } else {
            self.active.remove(id);
        }
        Ok(result)
    }

    /// Cancellation token of a process.
    pub(crate) fn cancel_token(&self, id: &str) -> Option<CancellationToken> {
        self.processes.get(id).map(|slot| slot.cancel.clone())
    }

    /// Flag a RUNNING process for cancellation. Returns false when there is
    /// nothing live to interrupt.
    pub(crate) fn request_cancel(&self, id: &str) -> bool {
        let Some(mut slot) = self.processes.get_mut(id) else {
            return false;
        };
        if slot.process.state != ProcessState::Running {
            return false;
        }
        slot.process.cancel_requested = true;
        slot.cancel.cancel();
        true
    }

    fn collect(&self, predicate: impl Fn(&Process) -> bool) -> Vec<Process> {
        self.processes
            .iter()
            .filter(|slot| predicate(&slot.process))
            .map(|slot| slot.process.clone())
            .collect()
    }
}
