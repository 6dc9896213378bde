use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::ValidationError;

pub type WorkflowId = Uuid;
pub type NodeId = String;

/// Node type handled by the engine itself: the node suspends until a human
/// submits data for it.
pub const UI_INTERACTION_NODE_TYPE: &str = "ui.interaction";

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl WorkflowGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Add a plain dependency edge that forwards the whole source output.
    pub fn connect(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) {
        self.edges.push(Edge::new(source, target));
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.push(edge);
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Node specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub node_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Overrides `WorkflowSettings::on_error` for this node
    #[serde(default)]
    pub on_failure: Option<FailurePolicy>,
    /// Output handed to dependents when the node is skipped
    #[serde(default)]
    pub default_output: Option<HashMap<String, Value>>,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: None,
            config: HashMap::new(),
            retry: None,
            on_failure: None,
            default_output: None,
        }
    }

    /// Shorthand for a human input node.
    pub fn interaction(id: impl Into<NodeId>, title: impl Into<String>) -> Self {
        Self::new(id, UI_INTERACTION_NODE_TYPE).with_config("title", Value::String(title.into()))
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_retry(mut self, max_attempts: u32) -> Self {
        self.retry = Some(RetryPolicy { max_attempts });
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = Some(policy);
        self
    }

    pub fn with_default_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.default_output
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn is_interaction(&self) -> bool {
        self.node_type == UI_INTERACTION_NODE_TYPE
    }

    /// Parse the interaction settings carried in `config`.
    pub fn interaction_spec(&self) -> Result<InteractionSpec, ValidationError> {
        let config = Value::Object(self.config.clone().into_iter().collect());
        serde_json::from_value(config).map_err(|e| ValidationError::InvalidConfig {
            node_id: self.id.clone(),
            message: e.to_string(),
        })
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Directed dependency between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    /// `target key -> source key`; without a mapping the whole source output
    /// is merged into the target's input
    #[serde(default)]
    pub mapping: Option<HashMap<String, String>>,
    #[serde(default)]
    pub condition: Option<EdgeCondition>,
}

impl Edge {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            mapping: None,
            condition: None,
        }
    }

    pub fn map(mut self, target_key: impl Into<String>, source_key: impl Into<String>) -> Self {
        self.mapping
            .get_or_insert_with(HashMap::new)
            .insert(target_key.into(), source_key.into());
        self
    }

    pub fn when(mut self, condition: EdgeCondition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Predicate over the source node's output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EdgeCondition {
    Equals { key: String, value: Value },
    Exists { key: String },
    Truthy { key: String },
}

impl EdgeCondition {
    pub fn evaluate(&self, data: &HashMap<String, Value>) -> bool {
        match self {
            EdgeCondition::Equals { key, value } => data.get(key) == Some(value),
            EdgeCondition::Exists { key } => data.get(key).is_some_and(|v| !v.is_null()),
            EdgeCondition::Truthy { key } => match data.get(key) {
                Some(Value::Bool(b)) => *b,
                Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
                Some(Value::String(s)) => !s.is_empty(),
                Some(Value::Array(a)) => !a.is_empty(),
                Some(Value::Object(o)) => !o.is_empty(),
                Some(Value::Null) | None => false,
            },
        }
    }
}

/// Bound on explicit retries of a node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// What a node failure means for the rest of the run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the execution
    Fail,
    /// Skip the node's descendants and finish with a partial failure
    Continue,
}

/// Settings of a `ui.interaction` node, read from its config
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionSpec {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub context: Value,
    /// User the session is routed to; the triggering user when absent
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub on_timeout: InteractionFallback,
    #[serde(default)]
    pub on_cancel: InteractionFallback,
}

/// How a cancelled or timed out interaction resolves its node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InteractionFallback {
    #[default]
    Fail,
    Skip,
}

/// Global workflow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Per-attempt limit for compute nodes
    pub node_timeout_ms: Option<u64>,
    /// Overrides the engine's concurrency limit for this workflow
    pub max_parallel_nodes: Option<usize>,
    pub on_error: ErrorHandling,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            node_timeout_ms: None,
            max_parallel_nodes: None,
            on_error: ErrorHandling::StopWorkflow,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorHandling {
    StopWorkflow,
    ContinueOnError,
}
