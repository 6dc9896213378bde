use async_trait::async_trait;
use loomcore::{Node, NodeContext, NodeError, NodeOutput};
use loomruntime::{NodeFactory, NodeMetadata};
use serde_json::Value;
use std::collections::HashMap;
use tokio::time::{sleep, Duration};

const DEFAULT_DELAY_MS: u64 = 1000;

/// Wait for `delay_ms`, then pass the inputs through
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let delay_ms = ctx
            .config
            .get("delay_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_DELAY_MS);

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled),
            _ = sleep(Duration::from_millis(delay_ms)) => {
                Ok(NodeOutput::from(ctx.inputs.clone()))
            }
        }
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DelayNode))
    }

    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            inputs: vec![],
            outputs: vec![],
        }
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        match config.get("delay_ms") {
            None => Ok(()),
            Some(v) if v.as_u64().is_some() => Ok(()),
            Some(v) => Err(NodeError::Configuration(format!(
                "`delay_ms` must be a non-negative integer, got {}",
                v
            ))),
        }
    }
}
