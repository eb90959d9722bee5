// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle events.
//!
//! A closed set of event kinds; every external stimulus (trigger, worker
//! ack/result, control request) becomes one of these, enqueued on the
//! owning runnable's event bus and handled by exactly one handler.
//! Adding a kind is a compile-time exhaustiveness concern in
//! [`crate::runnable::WorkflowExecutionRunnable::handle`].

use flowmaster_dag::TaskParam;

/// Outcome reported by a worker for one task attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Task finished successfully; variables it exported propagate to
    /// downstream tasks through the instance variable pool.
    Success {
        /// Variables exported by the task.
        var_pool: Vec<TaskParam>,
    },
    /// Task finished with an error.
    Failure {
        /// Worker-reported error message.
        message: String,
    },
    /// Task was killed on request.
    Killed,
}

/// A typed notification that something happened to a workflow or task
/// instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Begin executing the workflow instance.
    WorkflowStart,
    /// Cooperative pause request.
    WorkflowPause,
    /// Cooperative stop request; in-flight tasks are killed.
    WorkflowStop,
    /// Drive the instance to its terminal state and release ownership.
    WorkflowFinalize,
    /// Submit one task node for execution.
    TaskDispatch {
        /// Code of the task node to submit.
        task_code: i64,
    },
    /// Worker acknowledged a dispatched task and started executing.
    TaskRunning {
        /// Task instance the ack refers to.
        task_instance_id: i64,
        /// Worker that acked.
        worker_address: String,
    },
    /// Worker reported a final outcome for a task attempt.
    TaskResult {
        /// Task instance the result refers to.
        task_instance_id: i64,
        /// The reported outcome.
        outcome: TaskOutcome,
    },
    /// Retry a failed task after its configured interval.
    TaskRetry {
        /// Code of the task node to retry.
        task_code: i64,
    },
    /// Worker rejected a dispatched task (overload); re-dispatch
    /// elsewhere.
    TaskRecall {
        /// Task instance that was recalled.
        task_instance_id: i64,
    },
    /// Re-dispatch in-flight tasks whose assigned worker is dead.
    Failover,
}

impl LifecycleEvent {
    /// Stable kind name for logs and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStart => "workflow_start",
            Self::WorkflowPause => "workflow_pause",
            Self::WorkflowStop => "workflow_stop",
            Self::WorkflowFinalize => "workflow_finalize",
            Self::TaskDispatch { .. } => "task_dispatch",
            Self::TaskRunning { .. } => "task_running",
            Self::TaskResult { .. } => "task_result",
            Self::TaskRetry { .. } => "task_retry",
            Self::TaskRecall { .. } => "task_recall",
            Self::Failover => "failover",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_names() {
        assert_eq!(LifecycleEvent::WorkflowStart.kind(), "workflow_start");
        assert_eq!(
            LifecycleEvent::TaskDispatch { task_code: 1 }.kind(),
            "task_dispatch"
        );
        assert_eq!(
            LifecycleEvent::TaskResult {
                task_instance_id: 1,
                outcome: TaskOutcome::Killed,
            }
            .kind(),
            "task_result"
        );
        assert_eq!(LifecycleEvent::Failover.kind(), "failover");
    }
}
