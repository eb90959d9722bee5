// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowmaster core - event-driven workflow scheduling engine
//!
//! Each triggered workflow instance becomes a
//! [`runnable::WorkflowExecutionRunnable`]: a state machine advanced
//! exclusively by lifecycle events drained from its private delay bus.
//! Instances are assigned to shard slots by id, and one fire worker per
//! slot is the only task that ever drains its instances' buses, so no
//! instance can have two concurrent writers.
//!
//! ```text
//!  trigger/pause/stop        worker ack/result/recall
//!        |                            |
//!        v                            v
//!  WorkflowEngine            WorkerResponseProcessor
//!        \                          /
//!         \   (publish events)     /
//!          v                      v
//!      WorkflowEventBus  (one per instance, time-ordered)
//!                   |
//!                   |  poll + fire
//!                   v
//!      WorkflowEventBusFireWorker  (one per shard slot)
//!                   |
//!                   v
//!      WorkflowExecutionRunnable ---> Persistence / Transport
//! ```
//!
//! Handlers persist before they commit, so a transient persistence
//! failure requeues the triggering event unchanged and the retry is
//! idempotent.
//!
//! # Modules
//!
//! - [`engine`]: the embedder-facing facade and trigger requests
//! - [`runnable`]: the per-instance state machine
//! - [`bus`]: delay event buses with fire telemetry
//! - [`fire_worker`] / [`coordinator`]: shard workers and routing
//! - [`dispatch`]: worker transport/registry contracts, response intake
//! - [`task_group`]: FIFO admission control for bounded task groups
//! - [`persistence`]: storage contract and the in-memory implementation

#![deny(missing_docs)]

/// Delay event buses: time-ordered, non-blocking, with fire telemetry.
pub mod bus;

/// Time source abstraction.
pub mod clock;

/// Engine configuration, loadable from environment variables.
pub mod config;

/// Shared collaborator bundle.
pub mod context;

/// Shard routing over the fire workers.
pub mod coordinator;

/// Worker-facing contracts and response intake.
pub mod dispatch;

/// Engine facade.
pub mod engine;

/// Error types and the transient/logic/fatal classification.
pub mod error;

/// Lifecycle events.
pub mod event;

/// Per-shard event-firing loops.
pub mod fire_worker;

/// Storage contract and in-memory implementation.
pub mod persistence;

/// Repository of runnables owned by this process.
pub mod repository;

/// Per-instance workflow state machine.
pub mod runnable;

/// FIFO admission control: bounded task groups and serial workflows.
pub mod task_group;

pub use config::EngineConfig;
pub use engine::{WorkflowEngine, WorkflowEngineBuilder, WorkflowScheduleTriggerRequest};
pub use error::{EngineError, ErrorKind, Result};
pub use event::{LifecycleEvent, TaskOutcome};
