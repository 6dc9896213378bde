use async_trait::async_trait;
use loomcore::{Node, NodeContext, NodeError, NodeOutput};
use loomruntime::{NodeFactory, NodeMetadata, PortDefinition};
use serde_json::Value;
use std::collections::HashMap;

/// Parse a JSON string input into structured data
pub struct JsonParseNode;

#[async_trait]
impl Node for JsonParseNode {
    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let field = ctx
            .config
            .get("field")
            .and_then(Value::as_str)
            .unwrap_or("json");
        let input = ctx.require_str(field)?;

        let parsed: Value = serde_json::from_str(input)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        // Objects can be spread so dependents see their keys directly
        let spread = ctx
            .config
            .get("spread")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut output = NodeOutput::new();
        if let (true, Value::Object(map)) = (spread, &parsed) {
            output.outputs.extend(map.clone());
        }
        Ok(output.with_output("parsed", parsed))
    }
}

pub struct JsonParseNodeFactory;

impl NodeFactory for JsonParseNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonParseNode))
    }

    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Parse JSON string".to_string(),
            category: "transform".to_string(),
            inputs: vec![PortDefinition::required(
                "json",
                "JSON text (key configurable with `field`)",
            )],
            outputs: vec![PortDefinition::required("parsed", "Parsed value")],
        }
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        match config.get("field") {
            None | Some(Value::String(_)) => Ok(()),
            Some(_) => Err(NodeError::Configuration("`field` must be a string".into())),
        }
    }
}

/// Serialize an input value to JSON text
pub struct JsonStringifyNode;

#[async_trait]
impl Node for JsonStringifyNode {
    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input("value")?;
        let pretty = ctx
            .get_config_or("pretty", Value::Bool(false))
            .as_bool()
            .unwrap_or(false);

        let json = if pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(NodeOutput::new().with_output("json", json))
    }
}

pub struct JsonStringifyNodeFactory;

impl NodeFactory for JsonStringifyNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonStringifyNode))
    }

    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Convert value to JSON string".to_string(),
            category: "transform".to_string(),
            inputs: vec![PortDefinition::required("value", "Value to serialize")],
            outputs: vec![PortDefinition::required("json", "JSON text")],
        }
    }
}
