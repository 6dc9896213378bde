use loomcore::{ExecutionId, ExecutionStatus, NodeId, NodeStatus, WorkflowExecution};
use serde::Serialize;
use std::collections::BTreeMap;

/// Aggregate numbers for one execution, derived from its node records
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionStatistics {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub partial_failure: bool,
    pub total_nodes: usize,
    pub nodes_by_status: BTreeMap<String, usize>,
    pub total_attempts: u32,
    /// Nodes that needed more than one attempt
    pub retried_nodes: Vec<NodeId>,
    /// Wall time from start to finish, or to now for unfinished runs
    pub elapsed_ms: Option<u64>,
    pub total_node_time_ms: u64,
    pub average_node_time_ms: Option<u64>,
    pub slowest_node: Option<(NodeId, u64)>,
}

impl ExecutionStatistics {
    pub fn from_execution(exec: &WorkflowExecution) -> Self {
        let mut nodes_by_status = BTreeMap::new();
        let mut total_attempts = 0;
        let mut retried_nodes = Vec::new();
        let mut timed = Vec::new();

        for node in exec.nodes.values() {
            *nodes_by_status.entry(status_key(node.status)).or_insert(0) += 1;
            total_attempts += node.attempts;
            if node.attempts > 1 {
                retried_nodes.push(node.node_id.clone());
            }
            if let Some(ms) = node.duration_ms {
                timed.push((node.node_id.clone(), ms));
            }
        }

        let total_node_time_ms: u64 = timed.iter().map(|(_, ms)| ms).sum();
        let average_node_time_ms = (!timed.is_empty()).then(|| total_node_time_ms / timed.len() as u64);
        let slowest_node = timed.into_iter().max_by_key(|(_, ms)| *ms);

        let elapsed_ms = exec.started_at.map(|start| {
            let end = exec.finished_at.unwrap_or_else(chrono::Utc::now);
            (end - start).num_milliseconds().max(0) as u64
        });

        Self {
            execution_id: exec.id,
            status: exec.status,
            partial_failure: exec.partial_failure,
            total_nodes: exec.nodes.len(),
            nodes_by_status,
            total_attempts,
            retried_nodes,
            elapsed_ms,
            total_node_time_ms,
            average_node_time_ms,
            slowest_node,
        }
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes_by_status
            .get(&status_key(status))
            .copied()
            .unwrap_or(0)
    }
}

fn status_key(status: NodeStatus) -> String {
    format!("{:?}", status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomcore::{NodeSpec, WorkflowGraph};
    use std::collections::HashMap;

    #[test]
    fn test_statistics() {
        let mut graph = WorkflowGraph::new("stats");
        for id in ["a", "b", "c"] {
            graph.add_node(NodeSpec::new(id, "debug.log"));
        }
        let mut exec = WorkflowExecution::new(&graph, "alice", HashMap::new());
        for (id, status, attempts, ms) in [
            ("a", NodeStatus::Completed, 1, Some(10)),
            ("b", NodeStatus::Completed, 3, Some(40)),
            ("c", NodeStatus::Skipped, 0, None),
        ] {
            let node = exec.node_mut(id).unwrap();
            node.status = status;
            node.attempts = attempts;
            node.duration_ms = ms;
        }

        let stats = ExecutionStatistics::from_execution(&exec);

        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.count(NodeStatus::Completed), 2);
        assert_eq!(stats.count(NodeStatus::Skipped), 1);
        assert_eq!(stats.count(NodeStatus::Failed), 0);
        assert_eq!(stats.total_attempts, 4);
        assert_eq!(stats.retried_nodes, vec!["b".to_string()]);
        assert_eq!(stats.average_node_time_ms, Some(25));
        assert_eq!(stats.slowest_node, Some(("b".to_string(), 40)));
        assert_eq!(stats.elapsed_ms, None);
    }
}
