//! Core abstractions for the loom workflow engine
//!
//! This crate holds the workflow graph definition, the execution data model
//! persisted by the engine, the node trait implemented by work invokers and
//! the event bus. It has no runtime dependencies beyond tokio primitives.

mod contract;
mod error;
pub mod events;
mod execution;
mod node;
mod workflow;

pub use contract::{ContractSource, WorkflowDataContract};
pub use error::{ConflictError, EngineError, NodeError, StoreError, ValidationError};
pub use events::{EventBus, EventEmitter, ExecutionEvent, NodeEvent};
pub use execution::{
    ExecutionId, ExecutionLogEntry, ExecutionStatus, InteractionId, InteractionStatus, LogLevel,
    NodeErrorInfo, NodeExecutionRecord, NodeStatus, UiInteractionSession, UserId,
    WorkflowExecution,
};
pub use node::{json_type_name, Node, NodeContext, NodeOutput};
pub use workflow::{
    Edge, EdgeCondition, ErrorHandling, FailurePolicy, InteractionFallback, InteractionSpec,
    NodeId, NodeSpec, RetryPolicy, WorkflowGraph, WorkflowId, WorkflowSettings,
    UI_INTERACTION_NODE_TYPE,
};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
