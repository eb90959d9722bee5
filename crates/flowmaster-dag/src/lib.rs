// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowmaster DAG - workflow model and graph algorithms
//!
//! This crate holds the pure (non-async) half of the flowmaster scheduler:
//! workflow and task definitions, instance records with their status
//! machines, the dependency DAG with forbidden-node propagation, and the
//! deterministic cache-key derivation used to skip redundant task runs.
//!
//! The concurrent engine lives in `flowmaster-core`; everything here is
//! plain data and algorithms so it can be tested without a runtime.
//!
//! # Modules
//!
//! - [`model`]: workflow/task definitions, instances, status enums
//! - [`dag`]: dependency graph construction, cycle detection, readiness
//! - [`cache`]: cache-key generation, tagging and parsing

#![deny(missing_docs)]

/// Workflow and task definitions, instance records, and status enums.
pub mod model;

/// Dependency DAG over task codes: construction, cycles, readiness.
pub mod dag;

/// Deterministic cache-key derivation and parsing.
pub mod cache;

pub use cache::{
    CacheKeyInput, generate_cache_key, merge_params, revert_cache_key, tag_cache_key,
};
pub use dag::{DagError, WorkflowDag};
pub use model::{
    FailureStrategy, RunFlag, TaskDefinition, TaskExecutionStatus, TaskInstance, TaskParam,
    TaskRelation, WorkflowDefinition, WorkflowExecutionStatus, WorkflowInstance,
};
