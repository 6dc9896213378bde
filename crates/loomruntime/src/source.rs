use async_trait::async_trait;
use loomcore::{WorkflowGraph, WorkflowId};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Read-only lookup of workflow definitions
#[async_trait]
pub trait WorkflowSource: Send + Sync {
    async fn get_workflow(&self, id: WorkflowId) -> Option<WorkflowGraph>;
}

/// In-memory set of registered workflows
#[derive(Default)]
pub struct WorkflowCatalog {
    workflows: RwLock<HashMap<WorkflowId, WorkflowGraph>>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow, replacing any previous definition with the same id
    pub async fn register_workflow(&self, workflow: WorkflowGraph) -> WorkflowId {
        let id = workflow.id;
        tracing::info!(workflow_id = %id, name = %workflow.name, "Registered workflow");
        self.workflows.write().await.insert(id, workflow);
        id
    }

    pub async fn list(&self) -> Vec<WorkflowGraph> {
        let mut workflows: Vec<WorkflowGraph> =
            self.workflows.read().await.values().cloned().collect();
        workflows.sort_by(|a, b| a.name.cmp(&b.name));
        workflows
    }
}

#[async_trait]
impl WorkflowSource for WorkflowCatalog {
    async fn get_workflow(&self, id: WorkflowId) -> Option<WorkflowGraph> {
        self.workflows.read().await.get(&id).cloned()
    }
}
