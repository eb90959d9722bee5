// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared engine context handed to every runnable.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::dispatch::{Registry, Transport};
use crate::persistence::Persistence;
use crate::repository::WorkflowCacheRepository;
use crate::task_group::{SerialExecutionGate, TaskGroupCoordinator};

/// Immutable bundle of collaborators shared across the engine.
///
/// One context is built at engine construction and cloned by `Arc`
/// into every runnable and worker. All mutable state inside it is
/// individually synchronized.
pub struct EngineContext {
    /// Engine tuning knobs.
    pub config: EngineConfig,
    /// Time source; swapped for a manual clock in tests.
    pub clock: Arc<dyn Clock>,
    /// Durable store for instances and definitions.
    pub persistence: Arc<dyn Persistence>,
    /// Channel to remote workers.
    pub transport: Arc<dyn Transport>,
    /// Worker fleet discovery.
    pub registry: Arc<dyn Registry>,
    /// Admission control for bounded task groups.
    pub task_groups: TaskGroupCoordinator,
    /// Serial-execution queue per workflow definition.
    pub serial_gate: SerialExecutionGate,
    /// Runnables owned by this engine process.
    pub cache: Arc<WorkflowCacheRepository>,
}

impl EngineContext {
    /// Assemble a context from its collaborators.
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        persistence: Arc<dyn Persistence>,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn Registry>,
    ) -> Self {
        Self {
            config,
            clock,
            persistence,
            transport,
            registry,
            task_groups: TaskGroupCoordinator::new(),
            serial_gate: SerialExecutionGate::new(),
            cache: Arc::new(WorkflowCacheRepository::new()),
        }
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("cached_runnables", &self.cache.len())
            .finish()
    }
}
