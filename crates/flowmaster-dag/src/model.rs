// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow and task model types.
//!
//! Definitions describe what to run (immutable per code+version);
//! instances describe one execution of a definition and carry the
//! mutable status driven by the engine's lifecycle handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a task node actually executes or is skipped.
///
/// A `Forbidden` node never runs; it satisfies its successors'
/// dependency requirement as if it had completed, but contributes no
/// output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFlag {
    /// Normal execution.
    #[default]
    Normal,
    /// Skipped for submission; trivially satisfies successors.
    Forbidden,
}

/// How a workflow reacts to a permanent task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Fail fast: stop submitting new tasks, drain in-flight ones,
    /// finalize the workflow as failed.
    #[default]
    End,
    /// Keep executing branches that do not depend on the failed node;
    /// the workflow still finalizes as failed.
    Continue,
}

/// A single input parameter of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParam {
    /// Parameter name, referenced from scripts as `${prop}`.
    pub prop: String,
    /// Resolved value at submission time.
    pub value: String,
}

/// One executable node of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Stable task code, unique within the workflow definition.
    pub code: i64,
    /// Definition version; part of the cache key.
    pub version: i32,
    /// Human-readable name.
    pub name: String,
    /// Normal or forbidden (skipped) execution.
    #[serde(default)]
    pub run_flag: RunFlag,
    /// Script/command template executed by the worker.
    pub script: String,
    /// Declared input parameters.
    #[serde(default)]
    pub params: Vec<TaskParam>,
    /// Worker group the task is dispatched to.
    pub worker_group: String,
    /// Optional named task group for admission control.
    #[serde(default)]
    pub task_group: Option<String>,
    /// Environment configuration text; part of the cache key.
    #[serde(default)]
    pub environment_config: Option<String>,
    /// Maximum retries after a failed attempt.
    #[serde(default)]
    pub retry_limit: u32,
    /// Seconds to wait before a retry attempt.
    #[serde(default)]
    pub retry_interval_secs: u32,
    /// Whether a cache-key match may skip re-execution.
    #[serde(default)]
    pub is_cache: bool,
}

/// A dependency edge: `post` runs after `pre` completes.
///
/// A `pre_task_code` of zero marks a source node (no predecessor),
/// matching the conventional relation-list encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRelation {
    /// Predecessor task code, or 0 for none.
    pub pre_task_code: i64,
    /// Successor task code.
    pub post_task_code: i64,
}

/// One workflow definition: tasks plus their dependency relations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable workflow code.
    pub code: i64,
    /// Definition version.
    pub version: i32,
    /// Human-readable name.
    pub name: String,
    /// Runs of this definition execute one at a time; later triggers
    /// queue in `SerialWait` until the run ahead of them finalizes.
    #[serde(default)]
    pub serial: bool,
    /// Task nodes.
    pub tasks: Vec<TaskDefinition>,
    /// Dependency relation list the DAG is built from.
    pub relations: Vec<TaskRelation>,
}

/// Execution status of one workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowExecutionStatus {
    /// Accepted, not yet started.
    Submitted,
    /// Start deferred until a scheduled time.
    DelayExecution,
    /// Queued behind another run of the same definition (serial mode).
    SerialWait,
    /// Actively executing tasks.
    Running,
    /// Pause requested; draining in-flight tasks.
    ReadyPause,
    /// Paused at a safe point.
    Paused,
    /// Stop requested; killing/draining in-flight tasks.
    ReadyStop,
    /// Stopped at a safe point.
    Stopped,
    /// All reachable tasks succeeded.
    Success,
    /// At least one task failed permanently.
    Failure,
}

impl WorkflowExecutionStatus {
    /// Whether the instance can never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Stopped)
    }

    /// Stable lowercase identifier, used in logs and persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::DelayExecution => "delay_execution",
            Self::SerialWait => "serial_wait",
            Self::Running => "running",
            Self::ReadyPause => "ready_pause",
            Self::Paused => "paused",
            Self::ReadyStop => "ready_stop",
            Self::Stopped => "stopped",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for WorkflowExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of one task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskExecutionStatus {
    /// Created, not yet dispatched.
    Submitted,
    /// Waiting for a task-group slot.
    Waiting,
    /// Sent to a worker, ack not yet received.
    Dispatched,
    /// Worker acknowledged and is executing.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error (a retry may still follow).
    Failure,
    /// Killed on request.
    Killed,
    /// Assigned worker died; pending fault-tolerant resubmission.
    NeedFaultTolerance,
}

impl TaskExecutionStatus {
    /// Whether the task finished (success, failure or kill).
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Killed)
    }

    /// Whether the task has been handed to a worker and not reported back.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }

    /// Stable lowercase identifier, used in logs and persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Waiting => "waiting",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Killed => "killed",
            Self::NeedFaultTolerance => "need_fault_tolerance",
        }
    }
}

impl fmt::Display for TaskExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Unique instance id.
    pub id: i64,
    /// Code of the definition being executed.
    pub workflow_code: i64,
    /// Version of the definition being executed.
    pub workflow_version: i32,
    /// Name copied from the definition at trigger time.
    pub name: String,
    /// Current execution status.
    pub status: WorkflowExecutionStatus,
    /// Failure strategy configured at trigger time.
    pub failure_strategy: FailureStrategy,
    /// Start-time parameters supplied by the trigger request.
    #[serde(default)]
    pub start_params: Vec<TaskParam>,
    /// Host of the owning master process.
    pub host: String,
    /// When execution started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the instance reached a terminal state.
    pub end_time: Option<DateTime<Utc>>,
}

/// One execution of a single DAG node within a workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Unique task instance id.
    pub id: i64,
    /// Owning workflow instance.
    pub workflow_instance_id: i64,
    /// Code of the task definition.
    pub task_code: i64,
    /// Version of the task definition.
    pub task_version: i32,
    /// Name copied from the definition.
    pub name: String,
    /// Current execution status.
    pub status: TaskExecutionStatus,
    /// Worker the task was dispatched to, once assigned.
    pub worker_address: Option<String>,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Maximum retries allowed.
    pub retry_limit: u32,
    /// Dispatch attempts consumed (recalls and send failures included).
    pub dispatch_attempts: u32,
    /// Tagged cache key (`"{source_task_instance_id}-{key}"`) when the
    /// result was served from cache, or the plain key when cached.
    pub cache_key: Option<String>,
    /// Variables the task exported on success; copied to later runs
    /// served from this instance's cached result.
    #[serde(default)]
    pub var_pool: Vec<TaskParam>,
    /// When the instance was first submitted.
    pub submit_time: Option<DateTime<Utc>>,
    /// When the worker acked and started executing.
    pub start_time: Option<DateTime<Utc>>,
    /// When the task finished.
    pub end_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_status_terminal() {
        assert!(WorkflowExecutionStatus::Success.is_terminal());
        assert!(WorkflowExecutionStatus::Failure.is_terminal());
        assert!(WorkflowExecutionStatus::Stopped.is_terminal());
        assert!(!WorkflowExecutionStatus::Running.is_terminal());
        assert!(!WorkflowExecutionStatus::Paused.is_terminal());
        assert!(!WorkflowExecutionStatus::ReadyStop.is_terminal());
    }

    #[test]
    fn test_task_status_predicates() {
        assert!(TaskExecutionStatus::Success.is_finished());
        assert!(TaskExecutionStatus::Failure.is_finished());
        assert!(TaskExecutionStatus::Killed.is_finished());
        assert!(!TaskExecutionStatus::Running.is_finished());

        assert!(TaskExecutionStatus::Dispatched.is_in_flight());
        assert!(TaskExecutionStatus::Running.is_in_flight());
        assert!(!TaskExecutionStatus::Waiting.is_in_flight());
        assert!(!TaskExecutionStatus::Success.is_in_flight());
    }

    #[test]
    fn test_status_as_str_roundtrip_serde() {
        let json = serde_json::to_string(&WorkflowExecutionStatus::ReadyPause).unwrap();
        assert_eq!(json, "\"ready_pause\"");
        let back: WorkflowExecutionStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, WorkflowExecutionStatus::ReadyPause);

        assert_eq!(TaskExecutionStatus::NeedFaultTolerance.as_str(), "need_fault_tolerance");
        assert_eq!(WorkflowExecutionStatus::DelayExecution.to_string(), "delay_execution");
    }
}
