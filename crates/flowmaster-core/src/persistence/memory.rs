// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence backend.
//!
//! Used by tests and by embedders that do not need durability. Supports
//! transient-fault injection so the requeue-and-retry path can be
//! exercised without a real database.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use async_trait::async_trait;
use flowmaster_dag::{TaskExecutionStatus, TaskInstance, WorkflowDefinition, WorkflowInstance};

use super::{Persistence, PersistenceError};

/// In-memory [`Persistence`] backend.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    workflows: Mutex<HashMap<i64, WorkflowInstance>>,
    tasks: Mutex<HashMap<i64, TaskInstance>>,
    definitions: Mutex<HashMap<(i64, i32), WorkflowDefinition>>,
    next_workflow_id: AtomicI64,
    next_task_id: AtomicI64,
    pending_transient_failures: AtomicU32,
    pending_query_failures: AtomicU32,
}

impl InMemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            next_workflow_id: AtomicI64::new(1),
            next_task_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    /// Seed a workflow definition.
    pub fn put_definition(&self, definition: WorkflowDefinition) {
        self.definitions
            .lock()
            .unwrap()
            .insert((definition.code, definition.version), definition);
    }

    /// Make the next `count` save operations fail with
    /// [`PersistenceError::Unavailable`], simulating a database outage.
    pub fn inject_transient_failures(&self, count: u32) {
        self.pending_transient_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` save operations fail with
    /// [`PersistenceError::Query`], a non-retryable failure.
    pub fn inject_query_failures(&self, count: u32) {
        self.pending_query_failures.store(count, Ordering::SeqCst);
    }

    /// Read back a persisted workflow instance.
    pub fn workflow_instance(&self, id: i64) -> Option<WorkflowInstance> {
        self.workflows.lock().unwrap().get(&id).cloned()
    }

    /// Read back a persisted task instance.
    pub fn task_instance(&self, id: i64) -> Option<TaskInstance> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }

    /// All persisted task instances of one workflow instance, sorted by
    /// id.
    pub fn task_instances_of(&self, workflow_instance_id: i64) -> Vec<TaskInstance> {
        let mut tasks: Vec<TaskInstance> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.workflow_instance_id == workflow_instance_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    fn check_outage(&self, operation: &str) -> Result<(), PersistenceError> {
        let remaining = self.pending_transient_failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .pending_transient_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(PersistenceError::Unavailable {
                operation: operation.to_string(),
                details: "injected outage".to_string(),
            });
        }
        let remaining = self.pending_query_failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .pending_query_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(PersistenceError::Query {
                operation: operation.to_string(),
                details: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn next_workflow_instance_id(&self) -> Result<i64, PersistenceError> {
        Ok(self.next_workflow_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn next_task_instance_id(&self) -> Result<i64, PersistenceError> {
        Ok(self.next_task_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn save_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<(), PersistenceError> {
        self.check_outage("save_workflow_instance")?;
        self.workflows
            .lock()
            .unwrap()
            .insert(instance.id, instance.clone());
        Ok(())
    }

    async fn save_task_instance(&self, instance: &TaskInstance) -> Result<(), PersistenceError> {
        self.check_outage("save_task_instance")?;
        self.tasks
            .lock()
            .unwrap()
            .insert(instance.id, instance.clone());
        Ok(())
    }

    async fn load_definition(
        &self,
        code: i64,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, PersistenceError> {
        Ok(self
            .definitions
            .lock()
            .unwrap()
            .get(&(code, version))
            .cloned())
    }

    async fn find_task_by_cache_key(
        &self,
        cache_key: &str,
    ) -> Result<Option<TaskInstance>, PersistenceError> {
        let tasks = self.tasks.lock().unwrap();
        let mut hits: Vec<&TaskInstance> = tasks
            .values()
            .filter(|t| {
                t.status == TaskExecutionStatus::Success
                    && t.cache_key.as_deref() == Some(cache_key)
            })
            .collect();
        hits.sort_by_key(|t| t.id);
        Ok(hits.first().map(|t| (*t).clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmaster_dag::{FailureStrategy, WorkflowExecutionStatus};

    fn workflow(id: i64) -> WorkflowInstance {
        WorkflowInstance {
            id,
            workflow_code: 100,
            workflow_version: 1,
            name: "wf".to_string(),
            status: WorkflowExecutionStatus::Submitted,
            failure_strategy: FailureStrategy::End,
            start_params: Vec::new(),
            host: "127.0.0.1:5678".to_string(),
            start_time: None,
            end_time: None,
        }
    }

    #[tokio::test]
    async fn test_save_is_upsert() {
        let store = InMemoryPersistence::new();
        let mut instance = workflow(1);
        store.save_workflow_instance(&instance).await.unwrap();

        instance.status = WorkflowExecutionStatus::Running;
        store.save_workflow_instance(&instance).await.unwrap();

        let read = store.workflow_instance(1).unwrap();
        assert_eq!(read.status, WorkflowExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_id_allocation_is_unique() {
        let store = InMemoryPersistence::new();
        let a = store.next_workflow_instance_id().await.unwrap();
        let b = store.next_workflow_instance_id().await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_transient_failure_injection() {
        let store = InMemoryPersistence::new();
        store.inject_transient_failures(2);

        let instance = workflow(1);
        let err = store.save_workflow_instance(&instance).await.unwrap_err();
        assert!(err.is_transient());
        let err = store.save_workflow_instance(&instance).await.unwrap_err();
        assert!(err.is_transient());

        // Outage over
        store.save_workflow_instance(&instance).await.unwrap();
        assert!(store.workflow_instance(1).is_some());
    }

    #[tokio::test]
    async fn test_query_failure_injection_is_not_transient() {
        let store = InMemoryPersistence::new();
        store.inject_query_failures(1);

        let instance = workflow(1);
        let err = store.save_workflow_instance(&instance).await.unwrap_err();
        assert!(!err.is_transient());

        store.save_workflow_instance(&instance).await.unwrap();
        assert!(store.workflow_instance(1).is_some());
    }

    #[tokio::test]
    async fn test_find_task_by_cache_key_only_matches_success() {
        let store = InMemoryPersistence::new();
        let mut task = TaskInstance {
            id: 1,
            workflow_instance_id: 1,
            task_code: 10,
            task_version: 1,
            name: "t".to_string(),
            status: TaskExecutionStatus::Failure,
            worker_address: None,
            retry_count: 0,
            retry_limit: 0,
            dispatch_attempts: 0,
            cache_key: Some("abc".to_string()),
            var_pool: vec![],
            submit_time: None,
            start_time: None,
            end_time: None,
        };
        store.save_task_instance(&task).await.unwrap();
        assert!(store.find_task_by_cache_key("abc").await.unwrap().is_none());

        task.status = TaskExecutionStatus::Success;
        store.save_task_instance(&task).await.unwrap();
        let hit = store.find_task_by_cache_key("abc").await.unwrap().unwrap();
        assert_eq!(hit.id, 1);
    }
}
