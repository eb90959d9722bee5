// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures: mock transport/registry and a deterministic
//! harness that drives a fire worker by explicit ticks instead of
//! spawned loops.

// Each test binary compiles this module; not all of them use every
// helper.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use flowmaster_core::clock::ManualClock;
use flowmaster_core::config::EngineConfig;
use flowmaster_core::context::EngineContext;
use flowmaster_core::dispatch::{
    ControlCommand, Registry, RegistryError, TaskDispatchRequest, Transport, TransportError,
    WorkerResponseProcessor,
};
use flowmaster_core::event::{LifecycleEvent, TaskOutcome};
use flowmaster_core::fire_worker::WorkflowEventBusFireWorker;
use flowmaster_core::persistence::{InMemoryPersistence, Persistence};
use flowmaster_core::runnable::WorkflowExecutionRunnable;
use flowmaster_dag::{
    FailureStrategy, RunFlag, TaskDefinition, TaskParam, TaskRelation, WorkflowDag,
    WorkflowDefinition, WorkflowExecutionStatus, WorkflowInstance,
};

/// Route tracing to the test writer; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How the mock transport reacts to dispatched tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoMode {
    /// Record only; the test plays the worker via the processor.
    Manual,
    /// Ack and report success immediately.
    Succeed,
    /// Report failure for the first `n` results, then succeed.
    FailFirst(u32),
}

/// Transport double that records traffic and can play a well-behaved
/// worker fleet.
pub struct RecordingTransport {
    pub dispatched: Mutex<Vec<(String, TaskDispatchRequest)>>,
    pub kills: Mutex<Vec<i64>>,
    mode: Mutex<AutoMode>,
    results_seen: AtomicU32,
    fail_next_sends: AtomicU32,
    /// task instance id -> owning workflow instance id, so kill
    /// commands can be answered.
    owners: Mutex<HashMap<i64, i64>>,
    processor: OnceLock<WorkerResponseProcessor>,
}

impl RecordingTransport {
    pub fn new(mode: AutoMode) -> Self {
        Self {
            dispatched: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
            mode: Mutex::new(mode),
            results_seen: AtomicU32::new(0),
            fail_next_sends: AtomicU32::new(0),
            owners: Mutex::new(HashMap::new()),
            processor: OnceLock::new(),
        }
    }

    pub fn set_mode(&self, mode: AutoMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Make the next `n` dispatch sends fail at the transport level.
    pub fn fail_next_sends(&self, n: u32) {
        self.fail_next_sends.store(n, Ordering::SeqCst);
    }

    pub fn attach_processor(&self, processor: WorkerResponseProcessor) {
        let _ = self.processor.set(processor);
    }

    /// Task codes in dispatch order.
    pub fn dispatched_codes(&self) -> Vec<i64> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.task_code)
            .collect()
    }

    /// Workers in dispatch order.
    pub fn dispatched_workers(&self) -> Vec<String> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|(w, _)| w.clone())
            .collect()
    }

    fn auto_respond(&self, request: &TaskDispatchRequest, worker: &str) {
        let mode = *self.mode.lock().unwrap();
        let Some(processor) = self.processor.get() else {
            return;
        };
        match mode {
            AutoMode::Manual => {}
            AutoMode::Succeed => {
                processor.ack(request.workflow_instance_id, request.task_instance_id, worker);
                processor.result(
                    request.workflow_instance_id,
                    request.task_instance_id,
                    TaskOutcome::Success { var_pool: vec![] },
                );
            }
            AutoMode::FailFirst(n) => {
                processor.ack(request.workflow_instance_id, request.task_instance_id, worker);
                let seen = self.results_seen.fetch_add(1, Ordering::SeqCst);
                let outcome = if seen < n {
                    TaskOutcome::Failure {
                        message: "scripted failure".to_string(),
                    }
                } else {
                    TaskOutcome::Success { var_pool: vec![] }
                };
                processor.result(request.workflow_instance_id, request.task_instance_id, outcome);
            }
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn dispatch(
        &self,
        worker: &str,
        request: TaskDispatchRequest,
    ) -> Result<(), TransportError> {
        let remaining = self.fail_next_sends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_sends.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Unreachable {
                worker: worker.to_string(),
                details: "scripted send failure".to_string(),
            });
        }
        self.owners
            .lock()
            .unwrap()
            .insert(request.task_instance_id, request.workflow_instance_id);
        self.dispatched
            .lock()
            .unwrap()
            .push((worker.to_string(), request.clone()));
        self.auto_respond(&request, worker);
        Ok(())
    }

    async fn send(&self, _worker: &str, command: ControlCommand) -> Result<(), TransportError> {
        let ControlCommand::Kill { task_instance_id } = command;
        self.kills.lock().unwrap().push(task_instance_id);
        if *self.mode.lock().unwrap() != AutoMode::Manual {
            let owner = self.owners.lock().unwrap().get(&task_instance_id).copied();
            if let (Some(processor), Some(workflow_instance_id)) = (self.processor.get(), owner) {
                processor.result(workflow_instance_id, task_instance_id, TaskOutcome::Killed);
            }
        }
        Ok(())
    }
}

/// Registry double with static worker groups and a liveness override.
pub struct StaticRegistry {
    groups: Mutex<HashMap<String, Vec<String>>>,
    dead: Mutex<HashSet<String>>,
    fail_next_lookups: AtomicU32,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            dead: Mutex::new(HashSet::new()),
            fail_next_lookups: AtomicU32::new(0),
        }
    }

    pub fn set_group(&self, group: &str, workers: &[&str]) {
        self.groups.lock().unwrap().insert(
            group.to_string(),
            workers.iter().map(|w| (*w).to_string()).collect(),
        );
    }

    pub fn mark_dead(&self, worker: &str) {
        self.dead.lock().unwrap().insert(worker.to_string());
    }

    pub fn fail_next_lookups(&self, n: u32) {
        self.fail_next_lookups.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn list_active_workers(&self, group: &str) -> Result<Vec<String>, RegistryError> {
        let remaining = self.fail_next_lookups.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_lookups.store(remaining - 1, Ordering::SeqCst);
            return Err(RegistryError::Unavailable {
                details: "scripted registry outage".to_string(),
            });
        }
        let dead = self.dead.lock().unwrap();
        Ok(self
            .groups
            .lock()
            .unwrap()
            .get(group)
            .map(|workers| {
                workers
                    .iter()
                    .filter(|w| !dead.contains(*w))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn is_alive(&self, address: &str) -> Result<bool, RegistryError> {
        Ok(!self.dead.lock().unwrap().contains(address))
    }
}

/// Deterministic engine-internals harness: one fire worker ticked
/// explicitly, a manual clock, and the in-memory persistence.
pub struct Harness {
    pub persistence: Arc<InMemoryPersistence>,
    pub transport: Arc<RecordingTransport>,
    pub registry: Arc<StaticRegistry>,
    pub clock: Arc<ManualClock>,
    pub ctx: Arc<EngineContext>,
    pub worker: Arc<WorkflowEventBusFireWorker>,
    pub processor: WorkerResponseProcessor,
}

impl Harness {
    pub fn new(mode: AutoMode) -> Self {
        init_tracing();
        let persistence = Arc::new(InMemoryPersistence::new());
        let transport = Arc::new(RecordingTransport::new(mode));
        let registry = Arc::new(StaticRegistry::new());
        registry.set_group("default", &["worker-1:1234", "worker-2:1234"]);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        let config = EngineConfig {
            shard_count: 1,
            poll_interval: Duration::from_millis(5),
            transient_backoff: Duration::from_millis(5),
            max_dispatch_attempts: 3,
            host: "test-host:5678".to_string(),
        };
        let ctx = Arc::new(EngineContext::new(
            config,
            clock.clone(),
            persistence.clone(),
            transport.clone(),
            registry.clone(),
        ));
        let worker = Arc::new(WorkflowEventBusFireWorker::new(
            0,
            ctx.config.poll_interval,
            ctx.config.transient_backoff,
        ));
        let processor = WorkerResponseProcessor::new(ctx.cache.clone());
        transport.attach_processor(processor.clone());
        Self {
            persistence,
            transport,
            registry,
            clock,
            ctx,
            worker,
            processor,
        }
    }

    /// Persist the definition, create an instance and its runnable,
    /// register it on the worker and enqueue the start event.
    pub async fn trigger(
        &self,
        definition: WorkflowDefinition,
        failure_strategy: FailureStrategy,
    ) -> Arc<WorkflowExecutionRunnable> {
        let dag = WorkflowDag::build(&definition.tasks, &definition.relations).unwrap();
        self.persistence.put_definition(definition.clone());
        let id = self.persistence.next_workflow_instance_id().await.unwrap();
        let instance = WorkflowInstance {
            id,
            workflow_code: definition.code,
            workflow_version: definition.version,
            name: definition.name.clone(),
            status: WorkflowExecutionStatus::Submitted,
            failure_strategy,
            start_params: vec![],
            host: self.ctx.config.host.clone(),
            start_time: None,
            end_time: None,
        };
        self.persistence.save_workflow_instance(&instance).await.unwrap();
        let runnable = Arc::new(WorkflowExecutionRunnable::new(instance, dag, self.ctx.clone()));
        self.ctx.cache.put(runnable.clone());
        self.worker.register(runnable.clone()).unwrap();
        runnable.bus().publish(LifecycleEvent::WorkflowStart);
        runnable
    }

    /// Tick the worker enough times for the instance to quiesce.
    pub async fn pump(&self) {
        for _ in 0..64 {
            self.worker.tick().await;
        }
    }

    pub fn workflow_status(&self, id: i64) -> WorkflowExecutionStatus {
        self.persistence.workflow_instance(id).unwrap().status
    }
}

/// A normal task with sensible defaults for tests.
pub fn task(code: i64) -> TaskDefinition {
    TaskDefinition {
        code,
        version: 1,
        name: format!("task-{code}"),
        run_flag: RunFlag::Normal,
        script: format!("run-{code}.sh"),
        params: vec![],
        worker_group: "default".to_string(),
        task_group: None,
        environment_config: None,
        retry_limit: 0,
        retry_interval_secs: 0,
        is_cache: false,
    }
}

pub fn forbidden(code: i64) -> TaskDefinition {
    TaskDefinition {
        run_flag: RunFlag::Forbidden,
        ..task(code)
    }
}

/// Build a definition from tasks and `(pre, post)` edges; `pre` 0 marks
/// a source node.
pub fn definition(code: i64, tasks: Vec<TaskDefinition>, edges: &[(i64, i64)]) -> WorkflowDefinition {
    WorkflowDefinition {
        code,
        version: 1,
        name: format!("workflow-{code}"),
        serial: false,
        tasks,
        relations: edges
            .iter()
            .map(|&(pre_task_code, post_task_code)| TaskRelation {
                pre_task_code,
                post_task_code,
            })
            .collect(),
    }
}

#[allow(dead_code)]
pub fn param(prop: &str, value: &str) -> TaskParam {
    TaskParam {
        prop: prop.to_string(),
        value: value.to_string(),
    }
}
