// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shard routing over the fire workers.
//!
//! Every workflow instance maps to exactly one shard slot by id, so the
//! same instance always lands on the same fire worker and never has two
//! concurrent writers. Shard count is fixed for the life of the engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::fire_worker::WorkflowEventBusFireWorker;
use crate::runnable::WorkflowExecutionRunnable;

/// Deterministic instance-to-shard assignment.
///
/// Plain modulo: sequential ids spread round-robin. Ids allocated in
/// bursts of `shard_count` multiples would skew, which sequence-style
/// allocators do not produce in practice.
pub fn calculate_shard_slot(workflow_instance_id: i64, shard_count: usize) -> usize {
    debug_assert!(shard_count > 0);
    workflow_instance_id.rem_euclid(shard_count as i64) as usize
}

/// Owns the fire workers and routes runnables to them by shard slot.
pub struct WorkflowEventBusCoordinator {
    workers: Vec<Arc<WorkflowEventBusFireWorker>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkflowEventBusCoordinator {
    /// Create `shard_count` idle fire workers.
    pub fn new(shard_count: usize, poll_interval: Duration, transient_backoff: Duration) -> Self {
        let workers = (0..shard_count)
            .map(|slot| {
                Arc::new(WorkflowEventBusFireWorker::new(
                    slot,
                    poll_interval,
                    transient_backoff,
                ))
            })
            .collect();
        Self {
            workers,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Number of shard slots.
    pub fn shard_count(&self) -> usize {
        self.workers.len()
    }

    /// Spawn the fire-worker loops. Calling again while running is a
    /// no-op.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap();
        if !handles.is_empty() {
            warn!("coordinator already started");
            return;
        }
        for worker in &self.workers {
            handles.push(tokio::spawn(worker.clone().run()));
        }
        info!(shard_count = self.workers.len(), "fire workers started");
    }

    /// Register a runnable on its shard's worker.
    pub fn register(&self, runnable: Arc<WorkflowExecutionRunnable>) -> Result<()> {
        let slot = calculate_shard_slot(runnable.id(), self.workers.len());
        self.workers[slot].register(runnable)
    }

    /// Remove a runnable from its shard's worker; idempotent.
    pub fn unregister(&self, workflow_instance_id: i64) {
        let slot = calculate_shard_slot(workflow_instance_id, self.workers.len());
        self.workers[slot].unregister(workflow_instance_id);
    }

    /// Total runnables registered across all shards.
    pub fn registered(&self) -> usize {
        self.workers.iter().map(|w| w.len()).sum()
    }

    /// Signal every worker to stop and wait for their loops to exit.
    pub async fn close(&self) {
        for worker in &self.workers {
            worker.shutdown();
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "fire worker task panicked");
            }
        }
        info!("fire workers stopped");
    }
}

impl std::fmt::Debug for WorkflowEventBusCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEventBusCoordinator")
            .field("shard_count", &self.workers.len())
            .field("registered", &self.registered())
            .finish()
    }
}
