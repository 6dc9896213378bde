#![allow(dead_code)]

use async_trait::async_trait;
use loomcore::{ExecutionId, ExecutionStatus, Node, NodeContext, NodeError, NodeOutput, WorkflowExecution};
use loomruntime::{
    EngineConfig, ExecutionStore, MemoryStore, NodeFactory, NodeRegistry, WorkflowCatalog,
    WorkflowEngine,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Passes its inputs through, plus every entry of the `set` config object.
struct Echo;

#[async_trait]
impl Node for Echo {
    fn node_type(&self) -> &str {
        "test.echo"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let mut outputs = ctx.inputs.clone();
        if let Some(Value::Object(set)) = ctx.config.get("set") {
            outputs.extend(set.clone());
        }
        Ok(NodeOutput::from(outputs))
    }
}

/// Fails until attempt `succeed_on_attempt` (never, when absent).
struct Flaky;

#[async_trait]
impl Node for Flaky {
    fn node_type(&self) -> &str {
        "test.flaky"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let succeed_on = ctx.config.get("succeed_on_attempt").and_then(Value::as_u64);
        match succeed_on {
            Some(n) if u64::from(ctx.attempt) >= n => {
                Ok(NodeOutput::new().with_output("attempt", ctx.attempt))
            }
            _ => Err(NodeError::ExecutionFailed(format!(
                "attempt {} failed",
                ctx.attempt
            ))),
        }
    }
}

/// Sleeps for `millis`, stopping early when cancelled.
struct Sleep;

#[async_trait]
impl Node for Sleep {
    fn node_type(&self) -> &str {
        "test.sleep"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let millis = ctx.config.get("millis").and_then(Value::as_u64).unwrap_or(0);
        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(millis)) => {
                Ok(NodeOutput::new().with_output("slept", millis))
            }
        }
    }
}

struct Factory<F: Fn() -> Box<dyn Node> + Send + Sync> {
    node_type: &'static str,
    make: F,
}

impl<F: Fn() -> Box<dyn Node> + Send + Sync> NodeFactory for Factory<F> {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok((self.make)())
    }

    fn node_type(&self) -> &str {
        self.node_type
    }
}

pub fn registry() -> Arc<NodeRegistry> {
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(Factory {
        node_type: "test.echo",
        make: || Box::new(Echo) as Box<dyn Node>,
    }));
    registry.register(Arc::new(Factory {
        node_type: "test.flaky",
        make: || Box::new(Flaky) as Box<dyn Node>,
    }));
    registry.register(Arc::new(Factory {
        node_type: "test.sleep",
        make: || Box::new(Sleep) as Box<dyn Node>,
    }));
    Arc::new(registry)
}

pub struct Harness {
    pub engine: WorkflowEngine,
    pub catalog: Arc<WorkflowCatalog>,
    pub store: Arc<dyn ExecutionStore>,
}

pub fn harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new()), EngineConfig::default())
}

/// Route engine logs through the test harness; `RUST_LOG` picks the level.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn harness_with(store: Arc<dyn ExecutionStore>, config: EngineConfig) -> Harness {
    init_tracing();
    let catalog = Arc::new(WorkflowCatalog::new());
    let engine = WorkflowEngine::builder()
        .config(config)
        .registry(registry())
        .workflows(catalog.clone())
        .store(store.clone())
        .build();
    Harness {
        engine,
        catalog,
        store,
    }
}

pub async fn finished(engine: &WorkflowEngine, id: ExecutionId) -> WorkflowExecution {
    tokio::time::timeout(Duration::from_secs(5), engine.wait_for_completion(id))
        .await
        .expect("execution did not finish in time")
        .unwrap()
}

pub async fn reached(
    engine: &WorkflowEngine,
    id: ExecutionId,
    status: ExecutionStatus,
) -> WorkflowExecution {
    let exec = tokio::time::timeout(
        Duration::from_secs(5),
        engine.wait_for(id, |s| s == status),
    )
    .await
    .expect("execution did not reach the expected status in time")
    .unwrap();
    assert_eq!(exec.status, status);
    exec
}

pub fn context(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Poll until `node_id` has `status`; node changes do not always move the
/// execution status.
pub async fn node_reached(
    engine: &WorkflowEngine,
    id: ExecutionId,
    node_id: &str,
    status: loomcore::NodeStatus,
) -> WorkflowExecution {
    let poll = async {
        loop {
            let exec = engine.get_status(id).await.unwrap();
            if exec.node_status(node_id) == Some(status) {
                return exec;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("node did not reach the expected status in time")
}
