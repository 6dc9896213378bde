//! Workflow execution runtime
//!
//! Validates workflow graphs, schedules their nodes, runs work invokers from
//! the node registry, suspends on human input and keeps every execution in
//! an `ExecutionStore`. `WorkflowEngine` is the entry point.

mod config;
mod engine;
mod executor;
mod graph;
mod interaction;
mod registry;
pub mod scheduler;
mod source;
mod stats;
pub mod store;

pub use config::{EngineConfig, RecoveryPolicy};
pub use engine::{ControlOutcome, WorkflowEngine, WorkflowEngineBuilder};
pub use executor::{AttemptResult, NodeExecutor, NodeJob};
pub use graph::ExecutionGraph;
pub use interaction::{validate_submission, InteractionManager};
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry, PortDefinition};
pub use source::{WorkflowCatalog, WorkflowSource};
pub use stats::ExecutionStatistics;
pub use store::{ExecutionStore, MemoryStore, SledStore};
