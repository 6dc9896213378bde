use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::NodeId;

/// Where a node's output came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContractSource {
    Computed,
    Interaction,
    SkippedDefault,
}

/// Output envelope a node hands to its dependents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDataContract {
    pub node_id: NodeId,
    pub source: ContractSource,
    pub data: HashMap<String, Value>,
    pub produced_at: DateTime<Utc>,
}

impl WorkflowDataContract {
    fn new(node_id: impl Into<NodeId>, source: ContractSource, data: HashMap<String, Value>) -> Self {
        Self {
            node_id: node_id.into(),
            source,
            data,
            produced_at: Utc::now(),
        }
    }

    pub fn computed(node_id: impl Into<NodeId>, data: HashMap<String, Value>) -> Self {
        Self::new(node_id, ContractSource::Computed, data)
    }

    pub fn from_interaction(node_id: impl Into<NodeId>, data: HashMap<String, Value>) -> Self {
        Self::new(node_id, ContractSource::Interaction, data)
    }

    /// Output synthesized for a skipped node so its dependents can run.
    pub fn skipped(node_id: impl Into<NodeId>, default: Option<HashMap<String, Value>>) -> Self {
        Self::new(node_id, ContractSource::SkippedDefault, default.unwrap_or_default())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn is_default(&self) -> bool {
        self.source == ContractSource::SkippedDefault
    }
}
