// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interface consumed by the engine.
//!
//! The storage layer itself (tables, SQL, schema) is an external
//! collaborator; this module defines the narrow contract the engine
//! needs plus an in-memory backend for tests and embedding.
//!
//! Error classification matters here: [`PersistenceError::Unavailable`]
//! marks transient connectivity failures, which make the engine requeue
//! the triggering event and back off instead of failing the instance.

pub mod memory;

pub use self::memory::InMemoryPersistence;

use async_trait::async_trait;
use flowmaster_dag::{TaskInstance, WorkflowDefinition, WorkflowInstance};
use thiserror::Error;

/// Persistence failures, split by retryability.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PersistenceError {
    /// Store temporarily unreachable; the operation may be retried.
    #[error("persistence unavailable during '{operation}': {details}")]
    Unavailable {
        /// The operation that failed.
        operation: String,
        /// Failure details.
        details: String,
    },

    /// The operation itself failed; retrying will not help.
    #[error("persistence query '{operation}' failed: {details}")]
    Query {
        /// The operation that failed.
        operation: String,
        /// Failure details.
        details: String,
    },
}

impl PersistenceError {
    /// Whether the failure is transient connectivity (retryable).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Storage contract consumed by the engine.
///
/// All writes are upserts: a transient failure causes the engine to
/// requeue and re-run the triggering handler, which may re-apply the
/// same write.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Allocate the next unique workflow-instance id.
    async fn next_workflow_instance_id(&self) -> Result<i64, PersistenceError>;

    /// Allocate the next unique task-instance id.
    async fn next_task_instance_id(&self) -> Result<i64, PersistenceError>;

    /// Insert or update a workflow instance.
    async fn save_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<(), PersistenceError>;

    /// Insert or update a task instance.
    async fn save_task_instance(&self, instance: &TaskInstance) -> Result<(), PersistenceError>;

    /// Load a workflow definition by code and version.
    async fn load_definition(
        &self,
        code: i64,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, PersistenceError>;

    /// Find a prior successful task instance stored under the given
    /// cache key, for cache-hit short-circuiting.
    async fn find_task_by_cache_key(
        &self,
        cache_key: &str,
    ) -> Result<Option<TaskInstance>, PersistenceError>;
}
