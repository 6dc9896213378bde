use crate::{events::EventEmitter, ExecutionId, NodeError, NodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Unit of work behind a compute node type
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "http.request", "transform.json_parse")
    fn node_type(&self) -> &str;

    /// Run one attempt against the resolved input
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: acquire resources before the attempt
    async fn initialize(&mut self) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Execution context passed to each node attempt
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,

    /// 1-based attempt number
    pub attempt: u32,

    /// Trigger context and dependency outputs, merged by the executor
    pub inputs: HashMap<String, Value>,

    /// Static configuration for this node
    pub config: HashMap<String, Value>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Tripped when the execution is cancelled
    pub cancellation: CancellationToken,
}

impl NodeContext {
    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// Get required string input
    pub fn require_str(&self, name: &str) -> Result<&str, NodeError> {
        let value = self.require_input(name)?;
        value.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: name.to_string(),
            expected: "string".to_string(),
            actual: json_type_name(value).to_string(),
        })
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Output from one node attempt
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeOutput {
    pub outputs: HashMap<String, Value>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

impl From<HashMap<String, Value>> for NodeOutput {
    fn from(outputs: HashMap<String, Value>) -> Self {
        Self { outputs }
    }
}
