// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory registry of the workflow instances owned by this master.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::runnable::WorkflowExecutionRunnable;

/// Maps workflow-instance id to its runnable.
///
/// This is the authoritative "is this instance currently owned by this
/// process" index. Safe for concurrent get/put/remove from shard
/// workers, response processors and the API layer.
#[derive(Debug, Default)]
pub struct WorkflowCacheRepository {
    inner: RwLock<HashMap<i64, Arc<WorkflowExecutionRunnable>>>,
}

impl WorkflowCacheRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a runnable by workflow-instance id.
    pub fn get(&self, workflow_instance_id: i64) -> Option<Arc<WorkflowExecutionRunnable>> {
        self.inner.read().unwrap().get(&workflow_instance_id).cloned()
    }

    /// Whether the instance is owned by this process.
    pub fn contains(&self, workflow_instance_id: i64) -> bool {
        self.inner.read().unwrap().contains_key(&workflow_instance_id)
    }

    /// Register a runnable, replacing any previous entry for its id.
    pub fn put(&self, runnable: Arc<WorkflowExecutionRunnable>) {
        self.inner.write().unwrap().insert(runnable.id(), runnable);
    }

    /// Remove a runnable; idempotent.
    pub fn remove(&self, workflow_instance_id: i64) -> Option<Arc<WorkflowExecutionRunnable>> {
        self.inner.write().unwrap().remove(&workflow_instance_id)
    }

    /// Snapshot of all owned runnables.
    pub fn get_all(&self) -> Vec<Arc<WorkflowExecutionRunnable>> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    /// Number of owned instances.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    /// Whether no instance is owned.
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    /// Drop all entries (engine shutdown).
    pub fn clear(&self) {
        self.inner.write().unwrap().clear();
    }
}
