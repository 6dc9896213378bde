use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::{NodeError, NodeId, WorkflowDataContract, WorkflowGraph, WorkflowId};

pub type ExecutionId = Uuid;
pub type InteractionId = Uuid;
pub type UserId = String;

/// Overall status of one workflow run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    WaitingForInput,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    WaitingForInput,
    Retrying,
    Completed,
    Failed,
    /// Skipped by an operator or by an untaken branch
    Skipped,
    /// Skipped because an upstream node failed
    SkippedUpstream,
    /// Abandoned when the execution was cancelled
    Cancelled,
}

impl NodeStatus {
    /// Dependents may run once their sources are in one of these states.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Skipped)
    }

    /// The node still has work ahead of it; an execution is not finished
    /// while any node is unfinished.
    pub fn is_unfinished(&self) -> bool {
        matches!(
            self,
            NodeStatus::Pending
                | NodeStatus::Ready
                | NodeStatus::Running
                | NodeStatus::WaitingForInput
                | NodeStatus::Retrying
        )
    }
}

/// Failure recorded on a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeErrorInfo {
    pub error: NodeError,
    pub message: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl NodeErrorInfo {
    pub fn new(error: NodeError, attempt: u32) -> Self {
        Self {
            message: error.to_string(),
            error,
            attempt,
            at: Utc::now(),
        }
    }
}

/// Per-node state inside one execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeExecutionRecord {
    pub node_id: NodeId,
    pub node_type: String,
    pub status: NodeStatus,
    pub attempts: u32,
    /// Resolved input of the latest attempt, reused by retries
    pub input: Option<HashMap<String, Value>>,
    pub output: Option<WorkflowDataContract>,
    pub error: Option<NodeErrorInfo>,
    pub skip_reason: Option<String>,
    /// Resumption token of the node's open interaction
    pub interaction_id: Option<InteractionId>,
    pub ready_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl NodeExecutionRecord {
    pub fn new(node_id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            status: NodeStatus::Pending,
            attempts: 0,
            input: None,
            output: None,
            error: None,
            skip_reason: None,
            interaction_id: None,
            ready_at: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }

    /// Record the end of the current attempt.
    pub fn finish(&mut self, status: NodeStatus) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64);
    }
}

/// One run of a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub triggered_by: UserId,
    pub trigger_context: HashMap<String, Value>,
    pub status: ExecutionStatus,
    /// Set when a tolerated node failure happened during the run
    pub partial_failure: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub nodes: BTreeMap<NodeId, NodeExecutionRecord>,
}

impl WorkflowExecution {
    /// Create a Pending execution with one record per graph node.
    pub fn new(
        graph: &WorkflowGraph,
        triggered_by: impl Into<UserId>,
        trigger_context: HashMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        let nodes = graph
            .nodes
            .iter()
            .map(|spec| {
                (
                    spec.id.clone(),
                    NodeExecutionRecord::new(spec.id.clone(), spec.node_type.clone()),
                )
            })
            .collect();

        Self {
            id: Uuid::new_v4(),
            workflow_id: graph.id,
            triggered_by: triggered_by.into(),
            trigger_context,
            status: ExecutionStatus::Pending,
            partial_failure: false,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            nodes,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeExecutionRecord> {
        self.nodes.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut NodeExecutionRecord> {
        self.nodes.get_mut(node_id)
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|n| n.status)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|n| n.status == status).count()
    }

    /// Outputs of every node that produced one, completed or skipped.
    pub fn outputs(&self) -> HashMap<NodeId, WorkflowDataContract> {
        self.nodes
            .values()
            .filter_map(|n| n.output.clone().map(|o| (n.node_id.clone(), o)))
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InteractionStatus {
    Pending,
    /// Data accepted, the owning node has not resumed yet
    Submitted,
    Completed,
    Cancelled,
    TimedOut,
}

/// Durable suspension point waiting on human input for one node attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UiInteractionSession {
    pub id: InteractionId,
    pub workflow_id: WorkflowId,
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub attempt: u32,
    pub assignee: UserId,
    pub title: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub context: Value,
    pub status: InteractionStatus,
    pub output: Option<HashMap<String, Value>>,
    pub responded_by: Option<UserId>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UiInteractionSession {
    pub fn is_pending(&self) -> bool {
        self.status == InteractionStatus::Pending
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.timeout_at.is_some_and(|t| t <= now)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Append-only, time-ordered record of what happened to an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLogEntry {
    /// Assigned by the store, strictly increasing per store
    pub sequence: u64,
    pub execution_id: ExecutionId,
    pub node_id: Option<NodeId>,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl ExecutionLogEntry {
    pub fn new(
        execution_id: ExecutionId,
        node_id: Option<NodeId>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            sequence: 0,
            execution_id,
            node_id,
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}
