//! Readiness and status rules of an execution.
//!
//! Everything here is a pure function over an `ExecutionGraph` and the
//! execution record. The engine calls these while holding the execution's
//! lock and persists the result.

use chrono::Utc;
use loomcore::{
    ExecutionStatus, FailurePolicy, NodeId, NodeStatus, WorkflowDataContract, WorkflowExecution,
};

use crate::graph::ExecutionGraph;

/// Nodes changed by a readiness pass
#[derive(Debug, Default, PartialEq)]
pub struct Promotion {
    pub ready: Vec<NodeId>,
    /// Nodes whose every inbound condition evaluated false
    pub branch_skipped: Vec<NodeId>,
}

pub const BRANCH_NOT_TAKEN: &str = "branch not taken";

/// Dependencies of `node_id` that are not yet Completed or Skipped.
pub fn unmet_dependencies(
    graph: &ExecutionGraph,
    exec: &WorkflowExecution,
    node_id: &str,
) -> Vec<NodeId> {
    graph
        .dependencies(node_id)
        .into_iter()
        .filter(|dep| {
            !exec
                .node_status(dep)
                .is_some_and(|status| status.satisfies_dependents())
        })
        .collect()
}

pub fn dependencies_met(graph: &ExecutionGraph, exec: &WorkflowExecution, node_id: &str) -> bool {
    unmet_dependencies(graph, exec, node_id).is_empty()
}

/// False when every inbound edge carries a condition and none holds.
pub fn branch_taken(graph: &ExecutionGraph, exec: &WorkflowExecution, node_id: &str) -> bool {
    let inbound = graph.inbound(node_id);
    if inbound.is_empty() || inbound.iter().any(|e| e.condition.is_none()) {
        return true;
    }
    inbound.iter().any(|edge| {
        let data = exec
            .node(&edge.source)
            .and_then(|n| n.output.as_ref())
            .map(|o| &o.data);
        match (&edge.condition, data) {
            (Some(condition), Some(data)) => condition.evaluate(data),
            _ => false,
        }
    })
}

/// Move Pending nodes whose dependencies are satisfied to Ready, skipping
/// untaken branches. Repeats until nothing changes, since a skip can
/// unblock further nodes.
pub fn promote_ready(graph: &ExecutionGraph, exec: &mut WorkflowExecution) -> Promotion {
    let mut promotion = Promotion::default();

    loop {
        let mut changed = false;
        for node_id in graph.topological_order() {
            if exec.node_status(node_id) != Some(NodeStatus::Pending)
                || !dependencies_met(graph, exec, node_id)
            {
                continue;
            }

            if branch_taken(graph, exec, node_id) {
                if let Some(node) = exec.node_mut(node_id) {
                    node.status = NodeStatus::Ready;
                    node.ready_at = Some(Utc::now());
                }
                promotion.ready.push(node_id.clone());
            } else {
                skip(graph, exec, node_id, BRANCH_NOT_TAKEN, NodeStatus::Skipped);
                promotion.branch_skipped.push(node_id.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    promotion
}

/// Ready and Retrying nodes to launch now, in topological order.
///
/// Compute nodes are bounded by `limit` minus the Running count. Interaction
/// nodes only open a session and hold no worker, so they are always taken.
pub fn dispatchable(graph: &ExecutionGraph, exec: &WorkflowExecution, limit: usize) -> Vec<NodeId> {
    let mut capacity = limit.saturating_sub(exec.count(NodeStatus::Running));
    let mut batch = Vec::new();

    for id in graph.topological_order() {
        if !matches!(
            exec.node_status(id),
            Some(NodeStatus::Ready) | Some(NodeStatus::Retrying)
        ) {
            continue;
        }
        if graph.spec(id).is_some_and(|s| s.is_interaction()) {
            batch.push(id.clone());
        } else if capacity > 0 {
            capacity -= 1;
            batch.push(id.clone());
        }
    }
    batch
}

/// Mark a node skipped and give it the default output its dependents read.
pub fn skip(
    graph: &ExecutionGraph,
    exec: &mut WorkflowExecution,
    node_id: &str,
    reason: &str,
    status: NodeStatus,
) {
    let default = graph.spec(node_id).and_then(|s| s.default_output.clone());
    if let Some(node) = exec.node_mut(node_id) {
        node.status = status;
        node.skip_reason = Some(reason.to_string());
        node.interaction_id = None;
        node.finished_at = Some(Utc::now());
        node.output = match status {
            NodeStatus::Skipped => Some(WorkflowDataContract::skipped(node_id, default)),
            _ => None,
        };
    }
}

/// Apply the failure policy of a node that just failed and return the nodes
/// it skipped.
///
/// `Continue` skips the node's descendants. `Fail` halts the run: every
/// Pending or Ready node is skipped, Running nodes may still finish and
/// WaitingForInput nodes are left for the caller to close. Each skipped
/// record carries its reason in `skip_reason`.
pub fn apply_failure(
    graph: &ExecutionGraph,
    exec: &mut WorkflowExecution,
    node_id: &str,
) -> Vec<NodeId> {
    let descendants = graph.descendants(node_id);
    let targets: Vec<NodeId> = match graph.failure_policy(node_id) {
        FailurePolicy::Continue => {
            exec.partial_failure = true;
            graph
                .topological_order()
                .iter()
                .filter(|id| descendants.contains(*id))
                .cloned()
                .collect()
        }
        FailurePolicy::Fail => graph.topological_order().to_vec(),
    };

    let mut skipped = Vec::new();
    for id in targets {
        if matches!(
            exec.node_status(&id),
            Some(NodeStatus::Pending) | Some(NodeStatus::Ready)
        ) {
            let reason = failure_skip_reason(node_id, descendants.contains(&id));
            skip(graph, exec, &id, &reason, NodeStatus::SkippedUpstream);
            skipped.push(id);
        }
    }
    skipped
}

/// Reason recorded on a node skipped because `failed` failed.
pub fn failure_skip_reason(failed: &str, downstream: bool) -> String {
    if downstream {
        format!("upstream node {} failed", failed)
    } else {
        format!("execution halted by failure of {}", failed)
    }
}

/// Nodes a halting failure leaves suspended, which must be closed for the
/// run to drain.
pub fn halted_waiting(graph: &ExecutionGraph, exec: &WorkflowExecution, node_id: &str) -> Vec<NodeId> {
    match graph.failure_policy(node_id) {
        FailurePolicy::Fail => exec
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::WaitingForInput)
            .map(|n| n.node_id.clone())
            .collect(),
        FailurePolicy::Continue => {
            let descendants = graph.descendants(node_id);
            exec.nodes
                .values()
                .filter(|n| n.status == NodeStatus::WaitingForInput && descendants.contains(&n.node_id))
                .map(|n| n.node_id.clone())
                .collect()
        }
    }
}

/// Undo upstream skips and re-apply the policies of nodes that are still
/// Failed. Used before an operator retries or skips a failed node.
pub fn reconcile_upstream_skips(graph: &ExecutionGraph, exec: &mut WorkflowExecution) {
    for node in exec.nodes.values_mut() {
        if node.status == NodeStatus::SkippedUpstream {
            node.status = NodeStatus::Pending;
            node.skip_reason = None;
            node.output = None;
            node.ready_at = None;
            node.finished_at = None;
        }
    }
    exec.partial_failure = false;

    let still_failed: Vec<NodeId> = graph
        .topological_order()
        .iter()
        .filter(|id| exec.node_status(id) == Some(NodeStatus::Failed))
        .cloned()
        .collect();
    for id in still_failed {
        apply_failure(graph, exec, &id);
    }
}

/// Derive the overall status from the node records. Returns the new status
/// when it changed. Terminal executions are left untouched.
pub fn refresh_status(graph: &ExecutionGraph, exec: &mut WorkflowExecution) -> Option<ExecutionStatus> {
    if exec.is_terminal() {
        return None;
    }

    let failed: Vec<&NodeId> = exec
        .nodes
        .values()
        .filter(|n| n.status == NodeStatus::Failed)
        .map(|n| &n.node_id)
        .collect();
    exec.partial_failure = failed
        .iter()
        .any(|id| graph.failure_policy(id) == FailurePolicy::Continue);
    let fatal = failed
        .iter()
        .any(|id| graph.failure_policy(id) == FailurePolicy::Fail);

    let unfinished = exec.nodes.values().any(|n| n.status.is_unfinished());
    let active = exec.nodes.values().any(|n| {
        matches!(
            n.status,
            NodeStatus::Running | NodeStatus::Ready | NodeStatus::Retrying
        )
    });
    let waiting = exec.count(NodeStatus::WaitingForInput) > 0;

    let next = if !unfinished {
        if fatal {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        }
    } else if exec.status == ExecutionStatus::Paused {
        ExecutionStatus::Paused
    } else if !active && waiting {
        ExecutionStatus::WaitingForInput
    } else {
        ExecutionStatus::Running
    };

    if next == exec.status {
        return None;
    }

    exec.status = next;
    if next.is_terminal() {
        exec.finished_at = Some(Utc::now());
    }
    exec.touch();
    Some(next)
}
