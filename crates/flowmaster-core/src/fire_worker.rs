// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One shard's event-firing loop.
//!
//! A fire worker owns a disjoint set of runnables (assigned by shard
//! slot) and is the only task that ever drains their buses, which is
//! what gives each workflow instance its single-writer guarantee. The
//! loop polls on an interval rather than blocking on wakeups: delayed
//! events (retries, backoffs) become eligible by time passing, so a
//! poll tick is the natural trigger.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::{EngineError, Result};
use crate::runnable::WorkflowExecutionRunnable;

/// Drains the event buses of every runnable assigned to one shard slot.
pub struct WorkflowEventBusFireWorker {
    slot: usize,
    poll_interval: Duration,
    transient_backoff: Duration,
    runnables: Mutex<HashMap<i64, Arc<WorkflowExecutionRunnable>>>,
    shutdown: Notify,
}

impl WorkflowEventBusFireWorker {
    /// Create an idle worker for one shard slot.
    pub fn new(slot: usize, poll_interval: Duration, transient_backoff: Duration) -> Self {
        Self {
            slot,
            poll_interval,
            transient_backoff,
            runnables: Mutex::new(HashMap::new()),
            shutdown: Notify::new(),
        }
    }

    /// Shard slot this worker serves.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Assign a runnable to this shard. Registering the same instance
    /// twice is a coordination bug and is rejected.
    pub fn register(&self, runnable: Arc<WorkflowExecutionRunnable>) -> Result<()> {
        let mut runnables = self.runnables.lock().unwrap();
        let id = runnable.id();
        if runnables.contains_key(&id) {
            return Err(EngineError::DuplicateRegistration {
                workflow_instance_id: id,
                slot: self.slot,
            });
        }
        debug!(slot = self.slot, workflow_instance_id = id, "runnable registered");
        runnables.insert(id, runnable);
        Ok(())
    }

    /// Remove a runnable from this shard; idempotent.
    pub fn unregister(&self, workflow_instance_id: i64) {
        if self
            .runnables
            .lock()
            .unwrap()
            .remove(&workflow_instance_id)
            .is_some()
        {
            debug!(
                slot = self.slot,
                workflow_instance_id, "runnable unregistered"
            );
        }
    }

    /// Number of runnables currently assigned.
    pub fn len(&self) -> usize {
        self.runnables.lock().unwrap().len()
    }

    /// Whether no runnable is assigned.
    pub fn is_empty(&self) -> bool {
        self.runnables.lock().unwrap().is_empty()
    }

    /// Request the run loop to exit after its current tick.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Poll-and-fire loop; runs until [`Self::shutdown`] is called.
    /// After a transient failure the next tick waits the transient
    /// backoff instead of the poll interval.
    pub async fn run(self: Arc<Self>) {
        info!(slot = self.slot, "fire worker started");
        let mut backoff = false;
        loop {
            let interval = if backoff {
                self.transient_backoff
            } else {
                self.poll_interval
            };
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!(slot = self.slot, "fire worker stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    backoff = self.tick().await;
                }
            }
        }
    }

    /// Drain every assigned bus once. Returns whether a transient
    /// failure occurred (the caller backs off before the next tick).
    pub async fn tick(&self) -> bool {
        let mut snapshot: Vec<Arc<WorkflowExecutionRunnable>> = {
            let runnables = self.runnables.lock().unwrap();
            runnables
                .values()
                .filter(|r| !r.bus().is_empty())
                .cloned()
                .collect()
        };
        // Cross-instance order is unspecified; drain in instance-id order
        // so ties (e.g. contended task-group slots) resolve deterministically.
        snapshot.sort_by_key(|r| r.id());

        let mut hit_transient = false;
        for runnable in &snapshot {
            if self.drain(runnable).await.is_err() {
                hit_transient = true;
            }
            if runnable.is_finalized() {
                self.unregister(runnable.id());
            }
        }
        hit_transient
    }

    /// Fire the elapsed events of one runnable in order. Stops at the
    /// first failure: a transient one leaves the event requeued at the
    /// front so ordering is preserved across the retry; any other
    /// failure drops the event and defers the runnable's remaining
    /// events to the next tick instead of applying them on top of a
    /// state whose last transition just failed.
    async fn drain(&self, runnable: &Arc<WorkflowExecutionRunnable>) -> std::result::Result<(), ()> {
        while let Some(event) = runnable.bus().poll() {
            runnable.bus().record_fire_attempt();
            let retained = event.clone();
            match runnable.handle(event).await {
                Ok(()) => {}
                Err(err) if err.is_transient() => {
                    runnable.bus().record_fire_requeue();
                    runnable.bus().requeue_front(retained);
                    debug!(
                        slot = self.slot,
                        workflow_instance_id = runnable.id(),
                        error = %err,
                        "transient failure, event requeued"
                    );
                    return Err(());
                }
                Err(err) => {
                    runnable.bus().record_fire_failure();
                    error!(
                        slot = self.slot,
                        workflow_instance_id = runnable.id(),
                        event = retained.kind(),
                        error = %err,
                        "event handler failed"
                    );
                    break;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowEventBusFireWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEventBusFireWorker")
            .field("slot", &self.slot)
            .field("runnables", &self.len())
            .finish()
    }
}
