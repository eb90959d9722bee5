// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance workflow state machine.
//!
//! [`WorkflowExecutionRunnable`] owns all mutable state of one workflow
//! instance and advances it by handling [`LifecycleEvent`]s in arrival
//! order. The shard-ownership model guarantees at most one caller is
//! inside [`WorkflowExecutionRunnable::handle`] at a time; the internal
//! mutex exists so worker-response intake can enqueue concurrently
//! while a handler runs, never to serialize two handlers.
//!
//! Handlers are written requeue-safe: each one checks its guards
//! against in-memory state, persists the updated record, and only then
//! commits the mutation and publishes follow-up events. A transient
//! persistence failure therefore leaves the in-memory state untouched
//! and the same event can be retried unchanged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flowmaster_dag::{
    CacheKeyInput, FailureStrategy, RunFlag, TaskDefinition, TaskExecutionStatus, TaskInstance,
    TaskParam, WorkflowDag, WorkflowExecutionStatus, WorkflowInstance, generate_cache_key,
    merge_params, tag_cache_key,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bus::WorkflowEventBus;
use crate::context::EngineContext;
use crate::dispatch::{ControlCommand, TaskDispatchRequest, resolve_script};
use crate::error::{EngineError, Result};
use crate::event::{LifecycleEvent, TaskOutcome};
use crate::task_group::SlotAcquisition;

/// Mutable execution state of one workflow instance.
struct RunnableState {
    workflow: WorkflowInstance,
    dag: WorkflowDag,
    /// Task instances keyed by task code (one instance per node, reused
    /// across retries and fault-tolerant re-dispatches).
    tasks: HashMap<i64, TaskInstance>,
    /// Codes whose task finished successfully (or was served from cache).
    completed: HashSet<i64>,
    /// Codes that failed permanently (retries exhausted or hard dispatch
    /// failure).
    failed: HashSet<i64>,
    /// Codes killed by a stop request.
    killed: HashSet<i64>,
    /// Codes for which a dispatch event has been published. Marked at
    /// publish time so a requeued completion never double-submits.
    submitted: HashSet<i64>,
    /// Codes currently holding a task-group slot.
    held_slots: HashSet<i64>,
    /// Variables exported by completed tasks, visible downstream.
    var_pool: Vec<TaskParam>,
    pause_requested: bool,
    stop_requested: bool,
    /// Set when `WorkflowFinalize` has been published, so quiescence
    /// checks after it do not publish a second one.
    finalize_published: bool,
}

/// The event-driven executor of one workflow instance.
pub struct WorkflowExecutionRunnable {
    id: i64,
    bus: WorkflowEventBus,
    ctx: Arc<EngineContext>,
    state: Mutex<RunnableState>,
    finalized: AtomicBool,
}

impl WorkflowExecutionRunnable {
    /// Create a runnable for an instance whose DAG is already validated.
    pub fn new(instance: WorkflowInstance, dag: WorkflowDag, ctx: Arc<EngineContext>) -> Self {
        let bus = WorkflowEventBus::new(ctx.clock.clone());
        Self {
            id: instance.id,
            bus,
            ctx,
            state: Mutex::new(RunnableState {
                workflow: instance,
                dag,
                tasks: HashMap::new(),
                completed: HashSet::new(),
                failed: HashSet::new(),
                killed: HashSet::new(),
                submitted: HashSet::new(),
                held_slots: HashSet::new(),
                var_pool: Vec::new(),
                pause_requested: false,
                stop_requested: false,
                finalize_published: false,
            }),
            finalized: AtomicBool::new(false),
        }
    }

    /// Workflow instance id this runnable executes.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The instance's private event bus.
    pub fn bus(&self) -> &WorkflowEventBus {
        &self.bus
    }

    /// Whether the instance reached its terminal state and released
    /// ownership.
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Current persisted-model status (for tests and introspection).
    pub async fn status(&self) -> WorkflowExecutionStatus {
        self.state.lock().await.workflow.status
    }

    /// Handle one lifecycle event. Transient errors leave state
    /// untouched so the caller can requeue the event unchanged.
    pub async fn handle(&self, event: LifecycleEvent) -> Result<()> {
        if self.is_finalized() {
            debug!(
                workflow_instance_id = self.id,
                event = event.kind(),
                "dropping event for finalized instance"
            );
            return Ok(());
        }
        let mut state = self.state.lock().await;
        match event {
            LifecycleEvent::WorkflowStart => self.on_workflow_start(&mut state).await,
            LifecycleEvent::WorkflowPause => self.on_workflow_pause(&mut state).await,
            LifecycleEvent::WorkflowStop => self.on_workflow_stop(&mut state).await,
            LifecycleEvent::WorkflowFinalize => self.on_workflow_finalize(&mut state).await,
            LifecycleEvent::TaskDispatch { task_code } => {
                self.on_task_dispatch(&mut state, task_code).await
            }
            LifecycleEvent::TaskRunning {
                task_instance_id,
                worker_address,
            } => {
                self.on_task_running(&mut state, task_instance_id, &worker_address)
                    .await
            }
            LifecycleEvent::TaskResult {
                task_instance_id,
                outcome,
            } => {
                self.on_task_result(&mut state, task_instance_id, outcome)
                    .await
            }
            LifecycleEvent::TaskRetry { task_code } => {
                self.on_task_retry(&mut state, task_code).await
            }
            LifecycleEvent::TaskRecall { task_instance_id } => {
                self.on_task_recall(&mut state, task_instance_id).await
            }
            LifecycleEvent::Failover => self.on_failover(&mut state).await,
        }
    }

    async fn on_workflow_start(&self, state: &mut RunnableState) -> Result<()> {
        if state.workflow.status.is_terminal() {
            return Ok(());
        }
        if state.workflow.status != WorkflowExecutionStatus::Running {
            let mut updated = state.workflow.clone();
            updated.status = WorkflowExecutionStatus::Running;
            updated.start_time = Some(self.ctx.clock.now());
            self.ctx.persistence.save_workflow_instance(&updated).await?;
            info!(
                workflow_instance_id = self.id,
                workflow_code = updated.workflow_code,
                "workflow started"
            );
            state.workflow = updated;
        }
        self.submit_ready(state);
        self.check_finalize(state);
        Ok(())
    }

    /// Publish a dispatch event for every DAG-ready node not yet
    /// submitted. Submission is suppressed while a pause or stop drains.
    fn submit_ready(&self, state: &mut RunnableState) {
        if state.pause_requested || state.stop_requested {
            return;
        }
        if state.workflow.failure_strategy == FailureStrategy::End && !state.failed.is_empty() {
            return;
        }
        for code in state.dag.ready_tasks(&state.completed) {
            if state.submitted.contains(&code)
                || state.failed.contains(&code)
                || state.killed.contains(&code)
            {
                continue;
            }
            debug!(
                workflow_instance_id = self.id,
                task_code = code,
                "submitting ready task"
            );
            state.submitted.insert(code);
            self.bus.publish(LifecycleEvent::TaskDispatch { task_code: code });
        }
    }

    async fn on_task_dispatch(&self, state: &mut RunnableState, task_code: i64) -> Result<()> {
        if state.pause_requested || state.stop_requested {
            self.check_finalize(state);
            return Ok(());
        }
        if state.workflow.failure_strategy == FailureStrategy::End && !state.failed.is_empty() {
            self.check_finalize(state);
            return Ok(());
        }
        let node = state
            .dag
            .node(task_code)
            .ok_or(EngineError::TaskNodeNotFound {
                workflow_instance_id: self.id,
                task_code,
            })?
            .clone();
        if node.run_flag == RunFlag::Forbidden {
            warn!(
                workflow_instance_id = self.id,
                task_code, "dispatch event for forbidden task, dropping"
            );
            return Ok(());
        }

        // Stale dispatch events (e.g. after a transient requeue raced a
        // completed transition) are dropped here.
        let current = state.tasks.get(&task_code).map(|t| t.status);
        match current {
            None
            | Some(TaskExecutionStatus::Submitted)
            | Some(TaskExecutionStatus::Waiting)
            | Some(TaskExecutionStatus::NeedFaultTolerance) => {}
            Some(status) => {
                debug!(
                    workflow_instance_id = self.id,
                    task_code,
                    %status,
                    "dropping stale dispatch event"
                );
                return Ok(());
            }
        }

        let params = merge_params(&node.params, &state.workflow.start_params, &state.var_pool);
        let script = resolve_script(&node.script, &params);

        if current.is_none() {
            let id = self.ctx.persistence.next_task_instance_id().await?;
            let instance = TaskInstance {
                id,
                workflow_instance_id: self.id,
                task_code,
                task_version: node.version,
                name: node.name.clone(),
                status: TaskExecutionStatus::Submitted,
                worker_address: None,
                retry_count: 0,
                retry_limit: node.retry_limit,
                dispatch_attempts: 0,
                cache_key: None,
                var_pool: vec![],
                submit_time: Some(self.ctx.clock.now()),
                start_time: None,
                end_time: None,
            };
            self.ctx.persistence.save_task_instance(&instance).await?;
            state.tasks.insert(task_code, instance);
        }

        // Cache lookup happens once, on the first attempt.
        let is_first_attempt = {
            let task = &state.tasks[&task_code];
            task.retry_count == 0 && task.cache_key.is_none()
        };
        if node.is_cache && is_first_attempt {
            // The key is derived from the unresolved template: the
            // `${prop}` scan decides which params participate, while
            // `params` supplies their resolved values.
            let key = generate_cache_key(&CacheKeyInput {
                task_code: node.code,
                task_version: node.version,
                environment_config: node.environment_config.as_deref(),
                script: &node.script,
                params: &params,
                file_checksums: &[],
            });
            if let Some(hit) = self.ctx.persistence.find_task_by_cache_key(&key).await? {
                let mut updated = state.tasks[&task_code].clone();
                updated.status = TaskExecutionStatus::Success;
                updated.cache_key = Some(tag_cache_key(hit.id, &key));
                updated.var_pool = hit.var_pool.clone();
                updated.end_time = Some(self.ctx.clock.now());
                self.ctx.persistence.save_task_instance(&updated).await?;
                info!(
                    workflow_instance_id = self.id,
                    task_code,
                    source_task_instance_id = hit.id,
                    "task served from cache"
                );
                state.tasks.insert(task_code, updated);
                state.completed.insert(task_code);
                // The cached run's exports flow downstream exactly as a
                // real execution's would.
                Self::merge_var_pool(&mut state.var_pool, &hit.var_pool);
                self.submit_ready(state);
                self.check_finalize(state);
                return Ok(());
            }
            let mut updated = state.tasks[&task_code].clone();
            updated.cache_key = Some(key);
            self.ctx.persistence.save_task_instance(&updated).await?;
            state.tasks.insert(task_code, updated);
        }

        if let Some(group) = node.task_group.as_deref() {
            if !state.held_slots.contains(&task_code) {
                if current == Some(TaskExecutionStatus::Waiting) {
                    // Woken by a release: the slot was transferred to us.
                    state.held_slots.insert(task_code);
                } else {
                    match self.ctx.task_groups.acquire(group, self.id, task_code) {
                        SlotAcquisition::Granted => {
                            state.held_slots.insert(task_code);
                        }
                        SlotAcquisition::Queued => {
                            let mut updated = state.tasks[&task_code].clone();
                            updated.status = TaskExecutionStatus::Waiting;
                            self.ctx.persistence.save_task_instance(&updated).await?;
                            debug!(
                                workflow_instance_id = self.id,
                                task_code, group, "task queued on full task group"
                            );
                            state.tasks.insert(task_code, updated);
                            return Ok(());
                        }
                    }
                }
            }
        }

        self.dispatch_to_worker(state, &node, script, params).await
    }

    async fn dispatch_to_worker(
        &self,
        state: &mut RunnableState,
        node: &TaskDefinition,
        script: String,
        params: Vec<TaskParam>,
    ) -> Result<()> {
        let workers = self
            .ctx
            .registry
            .list_active_workers(&node.worker_group)
            .await?;

        let attempts = state.tasks[&node.code].dispatch_attempts;
        if workers.is_empty() {
            let mut updated = state.tasks[&node.code].clone();
            updated.dispatch_attempts = attempts + 1;
            state.tasks.insert(node.code, updated);
            return self
                .record_dispatch_failure(
                    state,
                    node.code,
                    EngineError::NoWorkerAvailable(node.worker_group.clone()),
                )
                .await;
        }
        let worker = workers[attempts as usize % workers.len()].clone();

        let task = &state.tasks[&node.code];
        let request = TaskDispatchRequest {
            task_instance_id: task.id,
            workflow_instance_id: self.id,
            task_code: node.code,
            script,
            params,
            worker_group: node.worker_group.clone(),
        };
        match self.ctx.transport.dispatch(&worker, request).await {
            Ok(()) => {
                let mut updated = state.tasks[&node.code].clone();
                updated.status = TaskExecutionStatus::Dispatched;
                updated.worker_address = Some(worker.clone());
                updated.dispatch_attempts = attempts + 1;
                self.ctx.persistence.save_task_instance(&updated).await?;
                info!(
                    workflow_instance_id = self.id,
                    task_code = node.code,
                    task_instance_id = updated.id,
                    worker,
                    "task dispatched"
                );
                state.tasks.insert(node.code, updated);
                Ok(())
            }
            Err(err) => {
                let mut updated = state.tasks[&node.code].clone();
                updated.dispatch_attempts = attempts + 1;
                state.tasks.insert(node.code, updated);
                self.record_dispatch_failure(state, node.code, EngineError::from(err))
                    .await
            }
        }
    }

    /// A dispatch attempt failed before the worker accepted the task:
    /// re-publish with a backoff until the attempt budget is spent, then
    /// fail the task permanently.
    async fn record_dispatch_failure(
        &self,
        state: &mut RunnableState,
        task_code: i64,
        err: EngineError,
    ) -> Result<()> {
        let attempts = state.tasks[&task_code].dispatch_attempts;
        warn!(
            workflow_instance_id = self.id,
            task_code,
            dispatch_attempts = attempts,
            error = %err,
            "task dispatch attempt failed"
        );
        if attempts >= self.ctx.config.max_dispatch_attempts {
            self.fail_task_permanently(state, task_code).await
        } else {
            self.bus.publish_delayed(
                LifecycleEvent::TaskDispatch { task_code },
                self.ctx.config.transient_backoff,
            );
            Ok(())
        }
    }

    async fn on_task_running(
        &self,
        state: &mut RunnableState,
        task_instance_id: i64,
        worker_address: &str,
    ) -> Result<()> {
        let Some(task_code) = Self::code_of(state, task_instance_id) else {
            warn!(
                workflow_instance_id = self.id,
                task_instance_id, "ack for unknown task instance, dropping"
            );
            return Ok(());
        };
        let task = &state.tasks[&task_code];
        if !task.status.is_in_flight() {
            debug!(
                workflow_instance_id = self.id,
                task_instance_id,
                status = %task.status,
                "dropping stale ack"
            );
            return Ok(());
        }
        let mut updated = task.clone();
        updated.status = TaskExecutionStatus::Running;
        updated.worker_address = Some(worker_address.to_string());
        if updated.start_time.is_none() {
            updated.start_time = Some(self.ctx.clock.now());
        }
        self.ctx.persistence.save_task_instance(&updated).await?;
        state.tasks.insert(task_code, updated);
        Ok(())
    }

    async fn on_task_result(
        &self,
        state: &mut RunnableState,
        task_instance_id: i64,
        outcome: TaskOutcome,
    ) -> Result<()> {
        let Some(task_code) = Self::code_of(state, task_instance_id) else {
            warn!(
                workflow_instance_id = self.id,
                task_instance_id, "result for unknown task instance, dropping"
            );
            return Ok(());
        };
        if state.tasks[&task_code].status.is_finished() {
            debug!(
                workflow_instance_id = self.id,
                task_instance_id, "dropping duplicate task result"
            );
            return Ok(());
        }
        match outcome {
            TaskOutcome::Success { var_pool } => {
                let mut updated = state.tasks[&task_code].clone();
                updated.status = TaskExecutionStatus::Success;
                updated.var_pool = var_pool.clone();
                updated.end_time = Some(self.ctx.clock.now());
                self.ctx.persistence.save_task_instance(&updated).await?;
                info!(
                    workflow_instance_id = self.id,
                    task_code, task_instance_id, "task succeeded"
                );
                state.tasks.insert(task_code, updated);
                state.completed.insert(task_code);
                Self::merge_var_pool(&mut state.var_pool, &var_pool);
                self.release_task_group(state, task_code);
                self.submit_ready(state);
                self.check_finalize(state);
                Ok(())
            }
            TaskOutcome::Failure { message } => {
                self.handle_task_failed(state, task_code, &message).await
            }
            TaskOutcome::Killed => {
                let mut updated = state.tasks[&task_code].clone();
                updated.status = TaskExecutionStatus::Killed;
                updated.end_time = Some(self.ctx.clock.now());
                self.ctx.persistence.save_task_instance(&updated).await?;
                info!(
                    workflow_instance_id = self.id,
                    task_code, task_instance_id, "task killed"
                );
                state.tasks.insert(task_code, updated);
                state.killed.insert(task_code);
                self.release_task_group(state, task_code);
                self.check_finalize(state);
                Ok(())
            }
        }
    }

    async fn handle_task_failed(
        &self,
        state: &mut RunnableState,
        task_code: i64,
        message: &str,
    ) -> Result<()> {
        let mut updated = state.tasks[&task_code].clone();
        updated.status = TaskExecutionStatus::Failure;
        updated.end_time = Some(self.ctx.clock.now());
        self.ctx.persistence.save_task_instance(&updated).await?;
        warn!(
            workflow_instance_id = self.id,
            task_code,
            retry_count = updated.retry_count,
            retry_limit = updated.retry_limit,
            message,
            "task failed"
        );
        let retry_pending = updated.retry_count < updated.retry_limit;
        let interval = state
            .dag
            .node(task_code)
            .map(|n| u64::from(n.retry_interval_secs))
            .unwrap_or(0);
        state.tasks.insert(task_code, updated);
        self.release_task_group(state, task_code);
        if retry_pending {
            self.bus.publish_delayed(
                LifecycleEvent::TaskRetry { task_code },
                Duration::from_secs(interval),
            );
            Ok(())
        } else {
            state.failed.insert(task_code);
            if state.workflow.failure_strategy == FailureStrategy::Continue {
                self.submit_ready(state);
            }
            self.check_finalize(state);
            Ok(())
        }
    }

    /// Permanent failure without a worker-reported result (dispatch
    /// attempt budget spent). Retries do not apply: the task never ran.
    async fn fail_task_permanently(
        &self,
        state: &mut RunnableState,
        task_code: i64,
    ) -> Result<()> {
        let mut updated = state.tasks[&task_code].clone();
        updated.status = TaskExecutionStatus::Failure;
        updated.end_time = Some(self.ctx.clock.now());
        self.ctx.persistence.save_task_instance(&updated).await?;
        warn!(
            workflow_instance_id = self.id,
            task_code, "task failed permanently: dispatch attempts exhausted"
        );
        state.tasks.insert(task_code, updated);
        state.failed.insert(task_code);
        self.release_task_group(state, task_code);
        if state.workflow.failure_strategy == FailureStrategy::Continue {
            self.submit_ready(state);
        }
        self.check_finalize(state);
        Ok(())
    }

    async fn on_task_retry(&self, state: &mut RunnableState, task_code: i64) -> Result<()> {
        if state.pause_requested || state.stop_requested {
            self.check_finalize(state);
            return Ok(());
        }
        let Some(task) = state.tasks.get(&task_code) else {
            return Ok(());
        };
        if task.status != TaskExecutionStatus::Failure
            || task.retry_count >= task.retry_limit
            || state.failed.contains(&task_code)
        {
            return Ok(());
        }
        let mut updated = task.clone();
        updated.retry_count += 1;
        updated.status = TaskExecutionStatus::Submitted;
        updated.dispatch_attempts = 0;
        updated.worker_address = None;
        updated.end_time = None;
        self.ctx.persistence.save_task_instance(&updated).await?;
        info!(
            workflow_instance_id = self.id,
            task_code,
            retry_count = updated.retry_count,
            "retrying failed task"
        );
        state.tasks.insert(task_code, updated);
        self.bus.publish(LifecycleEvent::TaskDispatch { task_code });
        Ok(())
    }

    async fn on_task_recall(&self, state: &mut RunnableState, task_instance_id: i64) -> Result<()> {
        let Some(task_code) = Self::code_of(state, task_instance_id) else {
            warn!(
                workflow_instance_id = self.id,
                task_instance_id, "recall for unknown task instance, dropping"
            );
            return Ok(());
        };
        let task = &state.tasks[&task_code];
        if !task.status.is_in_flight() {
            return Ok(());
        }
        if task.dispatch_attempts >= self.ctx.config.max_dispatch_attempts {
            return self.fail_task_permanently(state, task_code).await;
        }
        let mut updated = task.clone();
        updated.status = TaskExecutionStatus::Submitted;
        updated.worker_address = None;
        self.ctx.persistence.save_task_instance(&updated).await?;
        info!(
            workflow_instance_id = self.id,
            task_code, task_instance_id, "task recalled by worker, re-dispatching"
        );
        state.tasks.insert(task_code, updated);
        self.bus.publish(LifecycleEvent::TaskDispatch { task_code });
        Ok(())
    }

    async fn on_workflow_pause(&self, state: &mut RunnableState) -> Result<()> {
        if state.workflow.status.is_terminal() || state.pause_requested {
            return Ok(());
        }
        let mut updated = state.workflow.clone();
        updated.status = WorkflowExecutionStatus::ReadyPause;
        self.ctx.persistence.save_workflow_instance(&updated).await?;
        info!(workflow_instance_id = self.id, "workflow pausing");
        state.workflow = updated;
        state.pause_requested = true;
        self.check_finalize(state);
        Ok(())
    }

    async fn on_workflow_stop(&self, state: &mut RunnableState) -> Result<()> {
        if state.workflow.status.is_terminal() || state.stop_requested {
            return Ok(());
        }
        let mut updated = state.workflow.clone();
        updated.status = WorkflowExecutionStatus::ReadyStop;
        self.ctx.persistence.save_workflow_instance(&updated).await?;
        info!(workflow_instance_id = self.id, "workflow stopping");
        state.workflow = updated;
        state.stop_requested = true;

        // Kill everything a worker is holding; the kill results arrive
        // later as task-result events and complete the drain.
        let in_flight: Vec<(i64, String)> = state
            .tasks
            .values()
            .filter(|t| t.status.is_in_flight())
            .filter_map(|t| t.worker_address.clone().map(|w| (t.id, w)))
            .collect();
        for (task_instance_id, worker) in in_flight {
            if let Err(err) = self
                .ctx
                .transport
                .send(&worker, ControlCommand::Kill { task_instance_id })
                .await
            {
                warn!(
                    workflow_instance_id = self.id,
                    task_instance_id,
                    worker,
                    error = %err,
                    "kill command failed, worker result may still arrive"
                );
            }
        }

        // Tasks queued on a task group never reached a worker: remove
        // them from the queue and settle them as killed directly.
        let waiting: Vec<i64> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskExecutionStatus::Waiting)
            .map(|t| t.task_code)
            .collect();
        for task_code in waiting {
            if let Some(group) = state.dag.node(task_code).and_then(|n| n.task_group.clone()) {
                self.ctx.task_groups.remove_waiter(&group, self.id, task_code);
            }
            let mut updated = state.tasks[&task_code].clone();
            updated.status = TaskExecutionStatus::Killed;
            updated.end_time = Some(self.ctx.clock.now());
            self.ctx.persistence.save_task_instance(&updated).await?;
            state.tasks.insert(task_code, updated);
            state.killed.insert(task_code);
        }

        self.check_finalize(state);
        Ok(())
    }

    async fn on_workflow_finalize(&self, state: &mut RunnableState) -> Result<()> {
        if state.workflow.status.is_terminal() {
            return Ok(());
        }
        let status = if state.stop_requested {
            WorkflowExecutionStatus::Stopped
        } else if state.pause_requested && state.failed.is_empty() {
            WorkflowExecutionStatus::Paused
        } else if !state.failed.is_empty() {
            WorkflowExecutionStatus::Failure
        } else if !state.killed.is_empty() {
            WorkflowExecutionStatus::Stopped
        } else if state.dag.all_complete(&state.completed) {
            WorkflowExecutionStatus::Success
        } else {
            warn!(
                workflow_instance_id = self.id,
                "finalize event with no terminal condition, ignoring"
            );
            return Ok(());
        };

        let mut updated = state.workflow.clone();
        updated.status = status;
        if status.is_terminal() {
            updated.end_time = Some(self.ctx.clock.now());
        }
        self.ctx.persistence.save_workflow_instance(&updated).await?;
        state.workflow = updated;

        // Give back any admission-control resources still tied to this
        // instance: queued waiters are withdrawn, held slots released.
        let waiting: Vec<i64> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskExecutionStatus::Waiting)
            .map(|t| t.task_code)
            .collect();
        for task_code in waiting {
            if let Some(group) = state.dag.node(task_code).and_then(|n| n.task_group.clone()) {
                self.ctx.task_groups.remove_waiter(&group, self.id, task_code);
            }
        }
        let leftover: Vec<i64> = state.held_slots.iter().copied().collect();
        for task_code in leftover {
            self.release_task_group(state, task_code);
        }

        self.finalized.store(true, Ordering::Release);
        self.ctx.cache.remove(self.id);

        // Hand the serial-execution turn to the next queued run of the
        // same definition; a waiter whose instance is gone is skipped.
        let mut next = self
            .ctx
            .serial_gate
            .leave(state.workflow.workflow_code, self.id);
        while let Some(waiting_id) = next.take() {
            match self.ctx.cache.get(waiting_id) {
                Some(waiting) => {
                    info!(
                        workflow_instance_id = waiting_id,
                        workflow_code = state.workflow.workflow_code,
                        "starting queued serial run"
                    );
                    waiting.bus().publish(LifecycleEvent::WorkflowStart);
                    break;
                }
                None => {
                    warn!(
                        workflow_instance_id = waiting_id,
                        "queued serial run no longer owned, skipping"
                    );
                    next = self
                        .ctx
                        .serial_gate
                        .leave(state.workflow.workflow_code, waiting_id);
                }
            }
        }

        info!(
            workflow_instance_id = self.id,
            status = %status,
            "workflow finalized"
        );
        Ok(())
    }

    async fn on_failover(&self, state: &mut RunnableState) -> Result<()> {
        let in_flight: Vec<(i64, String)> = state
            .tasks
            .values()
            .filter(|t| t.status.is_in_flight())
            .filter_map(|t| t.worker_address.clone().map(|w| (t.task_code, w)))
            .collect();
        for (task_code, worker) in in_flight {
            if self.ctx.registry.is_alive(&worker).await? {
                continue;
            }
            let mut updated = state.tasks[&task_code].clone();
            updated.status = TaskExecutionStatus::NeedFaultTolerance;
            updated.worker_address = None;
            self.ctx.persistence.save_task_instance(&updated).await?;
            warn!(
                workflow_instance_id = self.id,
                task_code, worker, "worker dead, re-dispatching in-flight task"
            );
            state.tasks.insert(task_code, updated);
            self.bus.publish(LifecycleEvent::TaskDispatch { task_code });
        }
        Ok(())
    }

    fn code_of(state: &RunnableState, task_instance_id: i64) -> Option<i64> {
        state
            .tasks
            .values()
            .find(|t| t.id == task_instance_id)
            .map(|t| t.task_code)
    }

    /// Later exports override earlier ones with the same prop.
    fn merge_var_pool(pool: &mut Vec<TaskParam>, exported: &[TaskParam]) {
        for param in exported {
            match pool.iter_mut().find(|p| p.prop == param.prop) {
                Some(existing) => existing.value = param.value.clone(),
                None => pool.push(param.clone()),
            }
        }
    }

    /// Release the task-group slot a finished task held. When the slot
    /// transfers to a waiter, the waiter's runnable gets a dispatch
    /// event; a waiter whose instance is gone passes the slot on.
    fn release_task_group(&self, state: &mut RunnableState, task_code: i64) {
        if !state.held_slots.remove(&task_code) {
            return;
        }
        let Some(group) = state.dag.node(task_code).and_then(|n| n.task_group.clone()) else {
            return;
        };
        let mut release = self.ctx.task_groups.release(&group);
        while let Some(waiter) = release.take() {
            if waiter.workflow_instance_id == self.id {
                self.bus.publish(LifecycleEvent::TaskDispatch {
                    task_code: waiter.task_code,
                });
                return;
            }
            match self.ctx.cache.get(waiter.workflow_instance_id) {
                Some(runnable) => {
                    runnable.bus().publish(LifecycleEvent::TaskDispatch {
                        task_code: waiter.task_code,
                    });
                    return;
                }
                None => {
                    warn!(
                        group,
                        workflow_instance_id = waiter.workflow_instance_id,
                        "woken task-group waiter no longer owned, passing slot on"
                    );
                    release = self.ctx.task_groups.release(&group);
                }
            }
        }
    }

    /// Publish `WorkflowFinalize` once the instance is quiescent under a
    /// terminal condition: everything complete, a drained stop/pause, or
    /// a permanent failure with nothing left to run.
    fn check_finalize(&self, state: &mut RunnableState) {
        if state.finalize_published {
            return;
        }
        // Waiting/submitted tasks count as quiescent under a drain: the
        // dispatch handler refuses to hand them to a worker once a
        // stop, pause or fail-fast condition holds.
        let none_in_flight = state.tasks.values().all(|t| !t.status.is_in_flight());
        let should = if state.dag.all_complete(&state.completed) {
            true
        } else if state.stop_requested || state.pause_requested {
            none_in_flight
        } else if !state.failed.is_empty() {
            // Under the fail-fast strategy newly ready tasks are never
            // submitted, so an unsubmitted ready task cannot keep the
            // instance alive.
            let none_submittable = state.workflow.failure_strategy == FailureStrategy::End
                || state
                    .dag
                    .ready_tasks(&state.completed)
                    .iter()
                    .all(|code| state.submitted.contains(code) || state.failed.contains(code));
            let none_retry_pending = state.tasks.values().all(|t| {
                t.status != TaskExecutionStatus::Failure
                    || state.failed.contains(&t.task_code)
                    || t.retry_count >= t.retry_limit
            });
            none_in_flight && none_submittable && none_retry_pending
        } else {
            false
        };
        if should {
            state.finalize_published = true;
            self.bus.publish(LifecycleEvent::WorkflowFinalize);
        }
    }
}

impl std::fmt::Debug for WorkflowExecutionRunnable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutionRunnable")
            .field("id", &self.id)
            .field("finalized", &self.is_finalized())
            .finish()
    }
}
