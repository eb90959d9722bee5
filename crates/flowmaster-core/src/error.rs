// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the execution engine.
//!
//! Every error carries an explicit [`ErrorKind`] so the retry-vs-surface
//! decision is made on data: `Transient` failures cause the triggering
//! event to be requeued and retried after a backoff, `Logic` failures are
//! logged and contained to the owning workflow instance, and `Fatal`
//! failures indicate a coordination bug that must not be tolerated.

use flowmaster_dag::DagError;
use thiserror::Error;

use crate::dispatch::{RegistryError, TransportError};
use crate::persistence::PersistenceError;

/// Result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Classification driving the requeue-retry / log-and-contain /
/// surface-immediately branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Infrastructure temporarily unreachable; retry after backoff.
    Transient,
    /// Unexpected handler/logic failure; contained, never retried.
    Logic,
    /// Coordination bug (e.g. duplicate shard registration); surfaced.
    Fatal,
}

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Persistence operation failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Registry (service discovery) operation failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Transport send failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Workflow definition does not exist.
    #[error("workflow definition {code} version {version} not found")]
    DefinitionNotFound {
        /// Workflow definition code.
        code: i64,
        /// Workflow definition version.
        version: i32,
    },

    /// Workflow instance is not owned by this process.
    #[error("workflow instance {0} not found in cache repository")]
    WorkflowInstanceNotFound(i64),

    /// A lifecycle event referenced a task instance the runnable does
    /// not know about.
    #[error("task instance {task_instance_id} not found in workflow instance {workflow_instance_id}")]
    TaskInstanceNotFound {
        /// Owning workflow instance id.
        workflow_instance_id: i64,
        /// Unknown task instance id.
        task_instance_id: i64,
    },

    /// A lifecycle event referenced a task code outside the DAG.
    #[error("task code {task_code} not found in workflow instance {workflow_instance_id}")]
    TaskNodeNotFound {
        /// Owning workflow instance id.
        workflow_instance_id: i64,
        /// Unknown task code.
        task_code: i64,
    },

    /// The same instance was registered on a shard twice.
    #[error("workflow instance {workflow_instance_id} already registered on shard {slot}")]
    DuplicateRegistration {
        /// Workflow instance id.
        workflow_instance_id: i64,
        /// Shard slot the duplicate registration targeted.
        slot: usize,
    },

    /// No active worker in the requested group.
    #[error("no active worker in group '{0}'")]
    NoWorkerAvailable(String),

    /// DAG construction failed.
    #[error("invalid dag: {0}")]
    Dag(#[from] DagError),
}

impl EngineError {
    /// Classify this error for the requeue-vs-surface decision.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Persistence(e) if e.is_transient() => ErrorKind::Transient,
            Self::Registry(_) => ErrorKind::Transient,
            Self::DuplicateRegistration { .. } => ErrorKind::Fatal,
            _ => ErrorKind::Logic,
        }
    }

    /// Whether the triggering event should be requeued and retried.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
