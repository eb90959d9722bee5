// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dependency DAG over task codes.
//!
//! Built once per workflow-instance start from the definition's relation
//! list and immutable afterwards. Readiness queries implement the
//! forbidden-node rule: a node with [`RunFlag::Forbidden`] never executes
//! but satisfies its successors' dependency requirement, transitively.

use crate::model::{RunFlag, TaskDefinition, TaskRelation};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors from DAG construction.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DagError {
    /// A relation references a task code that is not defined.
    #[error("relation references unknown task code {0}")]
    UnknownTask(i64),

    /// Two task definitions share the same code.
    #[error("duplicate task code {0}")]
    DuplicateTask(i64),

    /// The relation list contains a cycle.
    #[error("dependency cycle detected: {}", format_cycle(.0))]
    Cycle(Vec<i64>),
}

fn format_cycle(cycle: &[i64]) -> String {
    cycle
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Immutable dependency graph for one workflow instance.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    nodes: HashMap<i64, TaskDefinition>,
    successors: HashMap<i64, Vec<i64>>,
    predecessors: HashMap<i64, Vec<i64>>,
}

impl WorkflowDag {
    /// Build a DAG from task definitions and a relation list.
    ///
    /// A `pre_task_code` of 0 marks a source edge and adds no
    /// predecessor. Fails on unknown codes, duplicate codes, or cycles.
    pub fn build(tasks: &[TaskDefinition], relations: &[TaskRelation]) -> Result<Self, DagError> {
        let mut nodes = HashMap::with_capacity(tasks.len());
        for task in tasks {
            if nodes.insert(task.code, task.clone()).is_some() {
                return Err(DagError::DuplicateTask(task.code));
            }
        }

        let mut successors: HashMap<i64, Vec<i64>> = HashMap::new();
        let mut predecessors: HashMap<i64, Vec<i64>> = HashMap::new();
        for relation in relations {
            if !nodes.contains_key(&relation.post_task_code) {
                return Err(DagError::UnknownTask(relation.post_task_code));
            }
            if relation.pre_task_code == 0 {
                continue;
            }
            if !nodes.contains_key(&relation.pre_task_code) {
                return Err(DagError::UnknownTask(relation.pre_task_code));
            }
            successors
                .entry(relation.pre_task_code)
                .or_default()
                .push(relation.post_task_code);
            predecessors
                .entry(relation.post_task_code)
                .or_default()
                .push(relation.pre_task_code);
        }

        let dag = Self {
            nodes,
            successors,
            predecessors,
        };
        dag.check_acyclic()?;
        Ok(dag)
    }

    /// Depth-first cycle check over every node.
    fn check_acyclic(&self) -> Result<(), DagError> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        let mut codes: Vec<i64> = self.nodes.keys().copied().collect();
        codes.sort_unstable();
        for code in codes {
            self.dfs(code, &mut visited, &mut path)?;
        }
        Ok(())
    }

    fn dfs(
        &self,
        node: i64,
        visited: &mut HashSet<i64>,
        path: &mut Vec<i64>,
    ) -> Result<(), DagError> {
        if let Some(pos) = path.iter().position(|&n| n == node) {
            let mut cycle: Vec<i64> = path[pos..].to_vec();
            cycle.push(node);
            return Err(DagError::Cycle(cycle));
        }
        if visited.contains(&node) {
            return Ok(());
        }
        path.push(node);
        if let Some(children) = self.successors.get(&node) {
            for &child in children {
                self.dfs(child, visited, path)?;
            }
        }
        path.pop();
        visited.insert(node);
        Ok(())
    }

    /// Number of task nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the DAG has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a task definition by code.
    pub fn node(&self, code: i64) -> Option<&TaskDefinition> {
        self.nodes.get(&code)
    }

    /// Whether the DAG contains a node with the given code.
    pub fn contains(&self, code: i64) -> bool {
        self.nodes.contains_key(&code)
    }

    /// All task codes, sorted (deterministic iteration for tests/logs).
    pub fn task_codes(&self) -> Vec<i64> {
        let mut codes: Vec<i64> = self.nodes.keys().copied().collect();
        codes.sort_unstable();
        codes
    }

    /// Direct successors of a node.
    pub fn direct_successors(&self, code: i64) -> &[i64] {
        self.successors.get(&code).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct predecessors of a node.
    pub fn direct_predecessors(&self, code: i64) -> &[i64] {
        self.predecessors
            .get(&code)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn is_forbidden(&self, code: i64) -> bool {
        self.nodes
            .get(&code)
            .is_some_and(|t| t.run_flag == RunFlag::Forbidden)
    }

    /// The completed set extended with every forbidden node whose
    /// predecessors are themselves effectively complete (fixpoint).
    ///
    /// Forbidden nodes never execute, so a chain of forbidden nodes
    /// collapses and cannot block its dependents.
    fn effective_completed(&self, completed: &HashSet<i64>) -> HashSet<i64> {
        let mut effective = completed.clone();
        loop {
            let mut changed = false;
            for (&code, _) in self.nodes.iter().filter(|(c, _)| self.is_forbidden(**c)) {
                if effective.contains(&code) {
                    continue;
                }
                let satisfied = self
                    .direct_predecessors(code)
                    .iter()
                    .all(|pre| effective.contains(pre));
                if satisfied {
                    effective.insert(code);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        effective
    }

    /// Whether a single node's full predecessor set is satisfied by the
    /// given completed set. Forbidden nodes are never submittable.
    pub fn is_submittable(&self, code: i64, completed: &HashSet<i64>) -> bool {
        if !self.contains(code) || self.is_forbidden(code) {
            return false;
        }
        let effective = self.effective_completed(completed);
        self.direct_predecessors(code)
            .iter()
            .all(|pre| effective.contains(pre))
    }

    /// All non-forbidden nodes not yet completed whose predecessors are
    /// satisfied, sorted by code. The caller filters out nodes it has
    /// already submitted.
    pub fn ready_tasks(&self, completed: &HashSet<i64>) -> Vec<i64> {
        let effective = self.effective_completed(completed);
        let mut ready: Vec<i64> = self
            .nodes
            .iter()
            .filter(|(code, task)| {
                task.run_flag == RunFlag::Normal
                    && !completed.contains(code)
                    && self
                        .direct_predecessors(**code)
                        .iter()
                        .all(|pre| effective.contains(pre))
            })
            .map(|(code, _)| *code)
            .collect();
        ready.sort_unstable();
        ready
    }

    /// Whether every non-forbidden node has completed.
    pub fn all_complete(&self, completed: &HashSet<i64>) -> bool {
        self.nodes
            .iter()
            .filter(|(_, task)| task.run_flag == RunFlag::Normal)
            .all(|(code, _)| completed.contains(code))
    }
}
