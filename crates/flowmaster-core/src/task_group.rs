// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission control: task groups and serial workflow execution.
//!
//! A task group is a named resource with integer capacity; tasks
//! declaring group membership must acquire a slot before dispatch and
//! release it on completion. Requests beyond capacity queue FIFO.
//! Multiple shards' tasks compete for the same group concurrently, so
//! all group state sits behind one mutex.
//!
//! [`SerialExecutionGate`] is the workflow-level counterpart: at most
//! one run of a serial definition is active at a time, later runs wait
//! their turn FIFO.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::warn;

/// Result of a slot acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAcquisition {
    /// Capacity was available; the caller holds a slot.
    Granted,
    /// Group is full; the caller is queued and will be woken by a
    /// later release.
    Queued,
}

/// A task waiting for a group slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    /// Workflow instance owning the waiting task.
    pub workflow_instance_id: i64,
    /// Code of the waiting task node.
    pub task_code: i64,
}

#[derive(Debug)]
struct GroupState {
    capacity: u32,
    in_use: u32,
    waiters: VecDeque<Waiter>,
}

/// Capacity-bounded slot coordinator for named task groups.
///
/// Invariant: concurrently granted slots for a group never exceed its
/// configured capacity; waiters are woken in FIFO order.
#[derive(Debug, Default)]
pub struct TaskGroupCoordinator {
    groups: Mutex<HashMap<String, GroupState>>,
}

impl TaskGroupCoordinator {
    /// Create a coordinator with no groups configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or resize a group. Shrinking below the current in-use
    /// count does not revoke held slots; the group only stops granting
    /// until releases bring it under the new capacity.
    pub fn configure(&self, group: &str, capacity: u32) {
        let mut groups = self.groups.lock().unwrap();
        groups
            .entry(group.to_string())
            .and_modify(|state| state.capacity = capacity)
            .or_insert(GroupState {
                capacity,
                in_use: 0,
                waiters: VecDeque::new(),
            });
    }

    /// Request a slot. Grants immediately when capacity is available,
    /// otherwise queues the caller FIFO. Acquiring from an unconfigured
    /// group grants without accounting (admission control is opt-in).
    pub fn acquire(
        &self,
        group: &str,
        workflow_instance_id: i64,
        task_code: i64,
    ) -> SlotAcquisition {
        let mut groups = self.groups.lock().unwrap();
        let Some(state) = groups.get_mut(group) else {
            warn!(group, "acquire on unconfigured task group, granting");
            return SlotAcquisition::Granted;
        };
        if state.in_use < state.capacity {
            state.in_use += 1;
            SlotAcquisition::Granted
        } else {
            state.waiters.push_back(Waiter {
                workflow_instance_id,
                task_code,
            });
            SlotAcquisition::Queued
        }
    }

    /// Release a held slot. When a waiter is queued the slot transfers
    /// to it directly (the in-use count does not drop) and the waiter is
    /// returned so the caller can wake it with a dispatch event.
    pub fn release(&self, group: &str) -> Option<Waiter> {
        let mut groups = self.groups.lock().unwrap();
        let state = groups.get_mut(group)?;
        if let Some(waiter) = state.waiters.pop_front() {
            Some(waiter)
        } else {
            state.in_use = state.in_use.saturating_sub(1);
            None
        }
    }

    /// Remove a queued waiter (task killed/stopped before it got a
    /// slot). Returns whether the waiter was found.
    pub fn remove_waiter(&self, group: &str, workflow_instance_id: i64, task_code: i64) -> bool {
        let mut groups = self.groups.lock().unwrap();
        let Some(state) = groups.get_mut(group) else {
            return false;
        };
        let before = state.waiters.len();
        state.waiters.retain(|w| {
            !(w.workflow_instance_id == workflow_instance_id && w.task_code == task_code)
        });
        state.waiters.len() != before
    }

    /// Currently granted slots for a group (0 for unknown groups).
    pub fn granted(&self, group: &str) -> u32 {
        self.groups
            .lock()
            .unwrap()
            .get(group)
            .map(|s| s.in_use)
            .unwrap_or(0)
    }

    /// Currently queued waiters for a group.
    pub fn queued(&self, group: &str) -> usize {
        self.groups
            .lock()
            .unwrap()
            .get(group)
            .map(|s| s.waiters.len())
            .unwrap_or(0)
    }
}

/// Serial-execution gate for workflow definitions.
///
/// Each enrolled definition code has a FIFO queue of instance ids; the
/// head is the active run, everything behind it sits in `SerialWait`.
/// Only serial definitions are enrolled, so the gate is a no-op for
/// everything else.
#[derive(Debug, Default)]
pub struct SerialExecutionGate {
    queues: Mutex<HashMap<i64, VecDeque<i64>>>,
}

impl SerialExecutionGate {
    /// Create an empty gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll a new run of a definition. Returns whether the run may
    /// start immediately; otherwise it waits until every run ahead of
    /// it has left the gate.
    pub fn enroll(&self, workflow_code: i64, workflow_instance_id: i64) -> bool {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(workflow_code).or_default();
        queue.push_back(workflow_instance_id);
        queue.len() == 1
    }

    /// Remove a run from its definition's queue (finalized, or a
    /// queued run stopped before it started). When the removed run was
    /// the active head, the new head is returned so the caller can
    /// start it.
    pub fn leave(&self, workflow_code: i64, workflow_instance_id: i64) -> Option<i64> {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.get_mut(&workflow_code)?;
        let position = queue.iter().position(|id| *id == workflow_instance_id)?;
        queue.remove(position);
        let next = if position == 0 {
            queue.front().copied()
        } else {
            None
        };
        if queue.is_empty() {
            queues.remove(&workflow_code);
        }
        next
    }

    /// Runs queued behind the active one for a definition.
    pub fn waiting(&self, workflow_code: i64) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(&workflow_code)
            .map(|q| q.len().saturating_sub(1))
            .unwrap_or(0)
    }
}
