use crate::{ExecutionId, ExecutionStatus, InteractionId, InteractionStatus, NodeId, NodeStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the engine's control and query operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Node {node_id} failed: {source}")]
    NodeExecution {
        node_id: NodeId,
        #[source]
        source: NodeError,
    },

    #[error("Interaction {id} is {status:?}, expected Pending")]
    InteractionUnavailable {
        id: InteractionId,
        status: InteractionStatus,
    },

    #[error("Submission for interaction {id} rejected: {message}")]
    InvalidSubmission { id: InteractionId, message: String },

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(#[from] ConflictError),

    #[error("Interaction {id} timed out")]
    Timeout { id: InteractionId },

    #[error("Node {node_id} reached its retry limit of {max_attempts} attempts")]
    RetryLimitExceeded { node_id: NodeId, max_attempts: u32 },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("Node {node_id} not found in execution {execution_id}")]
    NodeNotFound {
        execution_id: ExecutionId,
        node_id: NodeId,
    },

    #[error("Interaction not found: {0}")]
    InteractionNotFound(InteractionId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error (correlation id {correlation_id}): {message}")]
    Internal {
        correlation_id: Uuid,
        message: String,
    },
}

impl EngineError {
    /// Wrap an unexpected failure, logging it under a fresh correlation id.
    pub fn internal(message: impl Into<String>) -> Self {
        let correlation_id = Uuid::new_v4();
        let message = message.into();
        tracing::error!(%correlation_id, "{}", message);
        EngineError::Internal {
            correlation_id,
            message,
        }
    }

    /// Short machine readable kind, used by the HTTP surface.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) | EngineError::InvalidSubmission { .. } => "validation",
            EngineError::NodeExecution { .. } => "node_execution",
            EngineError::InteractionUnavailable { .. } => "interaction_unavailable",
            EngineError::ConcurrencyConflict(_) => "concurrency_conflict",
            EngineError::Timeout { .. } => "timeout",
            EngineError::RetryLimitExceeded { .. } => "retry_limit_exceeded",
            EngineError::WorkflowNotFound(_)
            | EngineError::ExecutionNotFound(_)
            | EngineError::NodeNotFound { .. }
            | EngineError::InteractionNotFound(_) => "not_found",
            EngineError::Store(_) | EngineError::Internal { .. } => "internal",
        }
    }
}

/// A control operation found the target in a state it cannot act on.
/// Callers should re-query the status and decide again.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConflictError {
    #[error("execution {execution_id} is {status:?}")]
    Execution {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },

    #[error("node {node_id} is {status:?}")]
    Node { node_id: NodeId, status: NodeStatus },

    #[error("node {node_id} is not ready: waiting on {waiting_on:?}")]
    NotReady {
        node_id: NodeId,
        waiting_on: Vec<NodeId>,
    },

    #[error("interaction {interaction_id} does not belong to node {node_id}")]
    InteractionMismatch {
        interaction_id: InteractionId,
        node_id: NodeId,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Node initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Interaction cancelled by {user_id}: {reason}")]
    InteractionCancelled { user_id: String, reason: String },

    #[error("Interaction timed out")]
    InteractionTimedOut,

    #[error("Orphaned by restart")]
    Orphaned,
}

/// Structural problems found while validating a workflow graph
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Workflow has no nodes")]
    EmptyWorkflow,

    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Edge references unknown node: {0}")]
    UnknownEndpoint(NodeId),

    #[error("Node {0} depends on itself")]
    SelfLoop(NodeId),

    #[error("Cyclic dependency detected at node {0}")]
    CyclicDependency(NodeId),

    #[error("Unknown node type '{node_type}' on node {node_id}")]
    UnknownNodeType { node_id: NodeId, node_type: String },

    #[error("Invalid configuration on node {node_id}: {message}")]
    InvalidConfig { node_id: NodeId, message: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Interaction {id} is {actual:?}, expected {expected:?}")]
    InteractionConflict {
        id: InteractionId,
        expected: InteractionStatus,
        actual: InteractionStatus,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}
