use crate::graph::ExecutionGraph;
use crate::registry::NodeRegistry;
use loomcore::{
    EventBus, ExecutionId, NodeContext, NodeError, NodeId, NodeOutput, WorkflowExecution,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// One attempt of a compute node, detached from the execution record so it
/// can run without holding the execution lock
#[derive(Clone)]
pub struct NodeJob {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub node_type: String,
    pub attempt: u32,
    pub inputs: HashMap<String, Value>,
    pub config: HashMap<String, Value>,
    pub timeout: Option<Duration>,
    pub cancellation: CancellationToken,
}

#[derive(Debug)]
pub struct AttemptResult {
    pub node_id: NodeId,
    pub attempt: u32,
    pub outcome: Result<NodeOutput, NodeError>,
    pub duration_ms: u64,
}

/// Runs node attempts through the registry's work invokers
pub struct NodeExecutor {
    registry: Arc<NodeRegistry>,
    events: Arc<EventBus>,
}

impl NodeExecutor {
    pub fn new(registry: Arc<NodeRegistry>, events: Arc<EventBus>) -> Self {
        Self { registry, events }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Input for `node_id`: the trigger context for entry nodes, otherwise
    /// the outputs of its dependencies merged through the edge mappings.
    /// Edges whose condition does not hold contribute nothing.
    pub fn resolve_input(
        &self,
        graph: &ExecutionGraph,
        exec: &WorkflowExecution,
        node_id: &str,
    ) -> HashMap<String, Value> {
        if graph.is_entry(node_id) {
            return exec.trigger_context.clone();
        }

        let mut inputs = HashMap::new();
        for edge in graph.inbound(node_id) {
            let Some(output) = exec.node(&edge.source).and_then(|n| n.output.as_ref()) else {
                continue;
            };
            if edge
                .condition
                .as_ref()
                .is_some_and(|c| !c.evaluate(&output.data))
            {
                continue;
            }
            match &edge.mapping {
                Some(mapping) => {
                    for (target_key, source_key) in mapping {
                        if let Some(value) = output.data.get(source_key) {
                            inputs.insert(target_key.clone(), value.clone());
                        }
                    }
                }
                None => inputs.extend(output.data.clone()),
            }
        }
        inputs
    }

    /// Run one attempt to completion, timeout or cancellation.
    pub async fn run(&self, job: NodeJob) -> AttemptResult {
        let started = Instant::now();
        let node_id = job.node_id.clone();
        let attempt = job.attempt;

        tracing::debug!(
            execution_id = %job.execution_id,
            node_id = %job.node_id,
            node_type = %job.node_type,
            attempt,
            "Running node"
        );

        let outcome = self.attempt(job).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(_) => tracing::info!("Node {} completed in {}ms", node_id, duration_ms),
            Err(e) => tracing::warn!("Node {} attempt {} failed: {}", node_id, attempt, e),
        }

        AttemptResult {
            node_id,
            attempt,
            outcome,
            duration_ms,
        }
    }

    async fn attempt(&self, job: NodeJob) -> Result<NodeOutput, NodeError> {
        let mut node = self.registry.create_node(&job.node_type, &job.config)?;
        node.initialize()
            .await
            .map_err(|e| NodeError::InitializationFailed(e.to_string()))?;

        let ctx = NodeContext {
            execution_id: job.execution_id,
            node_id: job.node_id.clone(),
            attempt: job.attempt,
            inputs: job.inputs,
            config: job.config,
            events: self.events.create_emitter(job.execution_id, job.node_id.clone()),
            cancellation: job.cancellation.child_token(),
        };

        // A separate task keeps a panicking invoker from taking the
        // dispatcher down with it.
        let mut handle = tokio::spawn(async move { node.execute(ctx).await });

        let outcome = tokio::select! {
            _ = job.cancellation.cancelled() => Err(NodeError::Cancelled),
            _ = deadline(job.timeout) => Err(NodeError::Timeout {
                millis: job.timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
            }),
            joined = &mut handle => joined.unwrap_or_else(|e| {
                Err(NodeError::ExecutionFailed(format!("node task ended abnormally: {}", e)))
            }),
        };

        if !handle.is_finished() {
            handle.abort();
        }
        outcome
    }
}

async fn deadline(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}
