// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker-facing contracts and response intake.
//!
//! The wire protocol is an external collaborator; this module defines
//! the narrow [`Transport`] and [`Registry`] contracts the engine
//! consumes, plus [`WorkerResponseProcessor`], which turns inbound
//! worker responses (ack, result, recall) into lifecycle events on the
//! owning runnable's bus. The processor never mutates workflow state
//! directly: I/O callbacks only enqueue, the shard worker handles.

use async_trait::async_trait;
use flowmaster_dag::TaskParam;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::{LifecycleEvent, TaskOutcome};
use crate::repository::WorkflowCacheRepository;

/// One task handed to a worker for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDispatchRequest {
    /// Task instance being executed.
    pub task_instance_id: i64,
    /// Owning workflow instance.
    pub workflow_instance_id: i64,
    /// Code of the task definition.
    pub task_code: i64,
    /// The fully resolved script/command to run.
    pub script: String,
    /// Resolved parameters visible to the task.
    pub params: Vec<TaskParam>,
    /// Worker group the request targets.
    pub worker_group: String,
}

/// Out-of-band control sent to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Kill a running task instance.
    Kill {
        /// Task instance to kill.
        task_instance_id: i64,
    },
}

/// Transport failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Worker could not be reached.
    #[error("worker {worker} unreachable: {details}")]
    Unreachable {
        /// Worker address.
        worker: String,
        /// Failure details.
        details: String,
    },
}

/// Fire-and-forget channel to remote workers. Completion of dispatched
/// work arrives later as inbound events, never as a return value.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a task to a worker.
    async fn dispatch(
        &self,
        worker: &str,
        request: TaskDispatchRequest,
    ) -> Result<(), TransportError>;

    /// Send a control command to a worker.
    async fn send(&self, worker: &str, command: ControlCommand) -> Result<(), TransportError>;
}

/// Registry failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// Registry temporarily unreachable.
    #[error("registry unavailable: {details}")]
    Unavailable {
        /// Failure details.
        details: String,
    },
}

/// Service-discovery view of the worker fleet.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Addresses of the live workers in a group.
    async fn list_active_workers(&self, group: &str) -> Result<Vec<String>, RegistryError>;

    /// Whether a worker address is currently alive.
    async fn is_alive(&self, address: &str) -> Result<bool, RegistryError>;
}

/// Substitute `${prop}` references in a script with resolved values.
pub fn resolve_script(script: &str, params: &[TaskParam]) -> String {
    let mut resolved = script.to_string();
    for param in params {
        resolved = resolved.replace(&format!("${{{}}}", param.prop), &param.value);
    }
    resolved
}

/// Inbound worker-response intake.
///
/// Each response type becomes exactly one lifecycle event on the owning
/// runnable's bus. Responses for instances this process no longer owns
/// (finalized or failed over) are logged and dropped.
#[derive(Clone)]
pub struct WorkerResponseProcessor {
    cache: Arc<WorkflowCacheRepository>,
}

impl WorkerResponseProcessor {
    /// Create a processor publishing into the given repository.
    pub fn new(cache: Arc<WorkflowCacheRepository>) -> Self {
        Self { cache }
    }

    fn publish(&self, workflow_instance_id: i64, event: LifecycleEvent) {
        match self.cache.get(workflow_instance_id) {
            Some(runnable) => {
                debug!(
                    workflow_instance_id,
                    event = event.kind(),
                    "worker response enqueued"
                );
                runnable.bus().publish(event);
            }
            None => {
                warn!(
                    workflow_instance_id,
                    event = event.kind(),
                    "dropping worker response for unowned workflow instance"
                );
            }
        }
    }

    /// Worker acknowledged a dispatched task and started executing.
    pub fn ack(&self, workflow_instance_id: i64, task_instance_id: i64, worker_address: &str) {
        self.publish(
            workflow_instance_id,
            LifecycleEvent::TaskRunning {
                task_instance_id,
                worker_address: worker_address.to_string(),
            },
        );
    }

    /// Worker reported a final outcome for a task attempt.
    pub fn result(&self, workflow_instance_id: i64, task_instance_id: i64, outcome: TaskOutcome) {
        self.publish(
            workflow_instance_id,
            LifecycleEvent::TaskResult {
                task_instance_id,
                outcome,
            },
        );
    }

    /// Worker rejected a dispatched task because it is overloaded.
    pub fn recall(&self, workflow_instance_id: i64, task_instance_id: i64) {
        self.publish(
            workflow_instance_id,
            LifecycleEvent::TaskRecall { task_instance_id },
        );
    }
}

impl std::fmt::Debug for WorkerResponseProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerResponseProcessor").finish()
    }
}
