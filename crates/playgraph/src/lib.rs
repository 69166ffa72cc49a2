//! # playgraph
//!
//! Translate service topologies into ordered automation scripts and run
//! them against a remote executor.
//!
//! ## Core Concepts
//!
//! - **Topology**: resources (nodes) and relationships parsed from a
//!   topology document and the provider's type definitions
//! - **DependencyGraph**: lifecycle operations of every resource, ordered by
//!   requirements and relationship hooks
//! - **Scheduler**: walks the graph, renders one play per ready operation
//!   and dispatches it with bounded concurrency
//! - **InstanceStore**: append-only log of observed resource state, read
//!   back by intrinsic functions and by teardown runs
//!
//! ## Example
//!
//! ```ignore
//! use playgraph::{translate, AutoConfirm, InstanceStore, NoProgress, Settings, TranslateRequest};
//!
//! let settings = Settings::load(path)?;
//! let request = TranslateRequest::new(std::fs::read_to_string("topology.yaml")?, "demo");
//! let mut store = InstanceStore::in_memory("demo");
//! let output = translate(&request, &settings, &mut store, None, &mut NoProgress, &mut AutoConfirm)?;
//! ```
//!
//! ## Provider Traits
//!
//! - [`Emitter`]: renders operations for one automation tool
//! - [`ExecutorClient`]: runs instruction batches remotely
//! - [`SchedulerObserver`]: receives scheduling events
//! - [`ConfirmCallback`]: confirms destructive runs

pub mod config;
pub mod context;
pub mod emitter;
pub mod error;
pub mod executor;
pub mod functions;
pub mod graph;
pub mod scheduler;
pub mod state;
pub mod topology;
pub mod translate;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use config::{ExecutorConfig, ProviderConfig, Settings, TypeMapping};
pub use context::{
    AutoConfirm, AutoDecline, ConfirmCallback, NoProgress, RunContext, SchedulerObserver,
};
pub use emitter::{Emitter, Play, Tool, TypeDescription};
pub use error::{Error, ErrorCategory, Result};
pub use executor::{ExecutionConfig, ExecutorClient, HttpExecutorClient, InstructionResult};
pub use graph::{DependencyGraph, build_graph};
pub use scheduler::{NodeState, Scheduler};
pub use state::{InstanceStore, Snapshot, StateField};
pub use topology::Topology;
pub use translate::{TranslateOutput, TranslateRequest, format_outputs, translate};
pub use types::{LifecycleOp, OperationKey, OperationNode, ResourceTemplate};
