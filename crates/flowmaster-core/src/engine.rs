// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine facade: the one type embedders interact with.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use flowmaster_dag::{FailureStrategy, TaskParam, WorkflowDag, WorkflowExecutionStatus, WorkflowInstance};
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::coordinator::WorkflowEventBusCoordinator;
use crate::dispatch::{Registry, Transport, WorkerResponseProcessor};
use crate::error::{EngineError, Result};
use crate::event::LifecycleEvent;
use crate::persistence::Persistence;
use crate::repository::WorkflowCacheRepository;
use crate::runnable::WorkflowExecutionRunnable;

/// A request to start one run of a workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowScheduleTriggerRequest {
    /// Code of the definition to run.
    pub workflow_code: i64,
    /// Version of the definition to run.
    pub workflow_version: i32,
    /// Trigger-time parameters, overriding fixed definition params.
    pub start_params: Vec<TaskParam>,
    /// How the run reacts to a permanent task failure.
    pub failure_strategy: FailureStrategy,
    /// Defer the start by this long.
    pub start_delay: Option<Duration>,
}

/// Builder for [`WorkflowEngine`]. Persistence, transport and registry
/// are required; config and clock have defaults.
pub struct WorkflowEngineBuilder {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    persistence: Option<Arc<dyn Persistence>>,
    transport: Option<Arc<dyn Transport>>,
    registry: Option<Arc<dyn Registry>>,
}

impl WorkflowEngineBuilder {
    /// Start a builder with default config and the system clock.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            persistence: None,
            transport: None,
            registry: None,
        }
    }

    /// Override the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the time source (tests use a manual clock).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the durable store.
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the worker transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the worker registry.
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Assemble the engine. Fire workers are created but not started;
    /// call [`WorkflowEngine::start`].
    pub fn build(self) -> anyhow::Result<WorkflowEngine> {
        let persistence = self.persistence.context("persistence is required")?;
        let transport = self.transport.context("transport is required")?;
        let registry = self.registry.context("registry is required")?;
        let coordinator = WorkflowEventBusCoordinator::new(
            self.config.shard_count,
            self.config.poll_interval,
            self.config.transient_backoff,
        );
        let ctx = Arc::new(EngineContext::new(
            self.config,
            self.clock,
            persistence,
            transport,
            registry,
        ));
        Ok(WorkflowEngine { ctx, coordinator })
    }
}

impl Default for WorkflowEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The workflow scheduling engine.
///
/// Owns the shard coordinator and the shared context; all workflow
/// control (trigger, pause, stop, failover) goes through here and is
/// realized as events on the per-instance buses.
pub struct WorkflowEngine {
    ctx: Arc<EngineContext>,
    coordinator: WorkflowEventBusCoordinator,
}

impl WorkflowEngine {
    /// Start a builder.
    pub fn builder() -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::new()
    }

    /// Spawn the fire-worker loops.
    pub fn start(&self) {
        self.coordinator.start();
    }

    /// Trigger one run of a workflow definition. Returns the new
    /// workflow instance id; execution proceeds asynchronously.
    pub async fn trigger(&self, request: WorkflowScheduleTriggerRequest) -> Result<i64> {
        let definition = self
            .ctx
            .persistence
            .load_definition(request.workflow_code, request.workflow_version)
            .await?
            .ok_or(EngineError::DefinitionNotFound {
                code: request.workflow_code,
                version: request.workflow_version,
            })?;
        // Validate the graph before anything is persisted.
        let dag = WorkflowDag::build(&definition.tasks, &definition.relations)?;

        let id = self.ctx.persistence.next_workflow_instance_id().await?;
        // A serial definition admits one active run; later triggers
        // queue behind it and are started at its finalize.
        let may_start = !definition.serial || self.ctx.serial_gate.enroll(definition.code, id);
        let status = if !may_start {
            WorkflowExecutionStatus::SerialWait
        } else if request.start_delay.is_some() {
            WorkflowExecutionStatus::DelayExecution
        } else {
            WorkflowExecutionStatus::Submitted
        };
        let instance = WorkflowInstance {
            id,
            workflow_code: definition.code,
            workflow_version: definition.version,
            name: definition.name.clone(),
            status,
            failure_strategy: request.failure_strategy,
            start_params: request.start_params,
            host: self.ctx.config.host.clone(),
            start_time: None,
            end_time: None,
        };
        self.ctx.persistence.save_workflow_instance(&instance).await?;

        let runnable = Arc::new(WorkflowExecutionRunnable::new(
            instance,
            dag,
            self.ctx.clone(),
        ));
        self.ctx.cache.put(runnable.clone());
        if let Err(err) = self.coordinator.register(runnable.clone()) {
            self.ctx.cache.remove(id);
            if definition.serial {
                self.ctx.serial_gate.leave(definition.code, id);
            }
            return Err(err);
        }
        if may_start {
            runnable.bus().publish_delayed(
                LifecycleEvent::WorkflowStart,
                request.start_delay.unwrap_or(Duration::ZERO),
            );
        }
        info!(
            workflow_instance_id = id,
            workflow_code = definition.code,
            workflow_version = definition.version,
            delayed = request.start_delay.is_some(),
            serial_wait = !may_start,
            "workflow triggered"
        );
        Ok(id)
    }

    /// Request a cooperative pause of a running instance.
    pub fn pause_workflow(&self, workflow_instance_id: i64) -> Result<()> {
        self.publish_control(workflow_instance_id, LifecycleEvent::WorkflowPause)
    }

    /// Request a cooperative stop of a running instance.
    pub fn stop_workflow(&self, workflow_instance_id: i64) -> Result<()> {
        self.publish_control(workflow_instance_id, LifecycleEvent::WorkflowStop)
    }

    /// Re-dispatch the instance's in-flight tasks whose worker is dead.
    pub fn failover_workflow(&self, workflow_instance_id: i64) -> Result<()> {
        self.publish_control(workflow_instance_id, LifecycleEvent::Failover)
    }

    fn publish_control(&self, workflow_instance_id: i64, event: LifecycleEvent) -> Result<()> {
        let runnable = self
            .ctx
            .cache
            .get(workflow_instance_id)
            .ok_or(EngineError::WorkflowInstanceNotFound(workflow_instance_id))?;
        info!(
            workflow_instance_id,
            event = event.kind(),
            "control request enqueued"
        );
        runnable.bus().publish(event);
        Ok(())
    }

    /// Bound a task group's concurrent executions.
    pub fn configure_task_group(&self, group: &str, capacity: u32) {
        self.ctx.task_groups.configure(group, capacity);
    }

    /// Intake endpoint for worker responses.
    pub fn response_processor(&self) -> WorkerResponseProcessor {
        WorkerResponseProcessor::new(self.ctx.cache.clone())
    }

    /// The repository of runnables this process owns.
    pub fn cache(&self) -> &WorkflowCacheRepository {
        &self.ctx.cache
    }

    /// Stop the fire workers and release all owned runnables.
    pub async fn close(&self) {
        self.coordinator.close().await;
        self.ctx.cache.clear();
        info!("engine closed");
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("coordinator", &self.coordinator)
            .finish()
    }
}
