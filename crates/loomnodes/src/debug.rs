use async_trait::async_trait;
use loomcore::{Node, NodeContext, NodeError, NodeOutput};
use loomruntime::{NodeFactory, NodeMetadata, PortDefinition};
use serde_json::Value;
use std::collections::HashMap;

/// Logs its inputs and passes them through unchanged
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = ctx
            .inputs
            .get("message")
            .or_else(|| ctx.config.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("(no message)")
            .to_string();

        tracing::info!(
            execution_id = %ctx.execution_id,
            node_id = %ctx.node_id,
            "DEBUG: {}",
            message
        );
        ctx.events.info(format!("DEBUG: {}", message));

        // Also log all inputs for visibility
        let mut keys: Vec<&String> = ctx.inputs.keys().collect();
        keys.sort();
        for key in keys {
            ctx.events.info(format!("  {}: {}", key, ctx.inputs[key]));
        }

        let mut outputs = ctx.inputs.clone();
        outputs.insert("message".to_string(), Value::String(message));
        Ok(NodeOutput::from(outputs))
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DebugNode))
    }

    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs input values for debugging".to_string(),
            category: "debug".to_string(),
            inputs: vec![PortDefinition::optional("message", "Line to log")],
            outputs: vec![PortDefinition::required(
                "message",
                "The logged line; other inputs pass through",
            )],
        }
    }
}
