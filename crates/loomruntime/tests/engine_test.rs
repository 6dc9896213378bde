mod common;

use common::{context, finished, harness, node_reached, reached};
use loomcore::{
    ConflictError, ContractSource, Edge, EngineError, ErrorHandling, ExecutionStatus,
    FailurePolicy, InteractionStatus, NodeError, NodeSpec, NodeStatus, WorkflowGraph, WorkflowSettings,
};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

fn echo(id: &str) -> NodeSpec {
    NodeSpec::new(id, "test.echo")
}

fn sleep(id: &str, millis: u64) -> NodeSpec {
    NodeSpec::new(id, "test.sleep").with_config("millis", millis)
}

#[tokio::test]
async fn test_diamond_runs_to_completion() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("diamond");
    workflow.add_node(echo("a"));
    workflow.add_node(echo("b").with_config("set", json!({"left": true})));
    workflow.add_node(echo("c").with_config("set", json!({"right": true})));
    workflow.add_node(echo("d"));
    workflow.connect("a", "b");
    workflow.connect("a", "c");
    workflow.connect("b", "d");
    workflow.connect("c", "d");
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, context(&[("seed", json!(7))]), "alice")
        .await
        .unwrap();
    let exec = finished(&h.engine, id).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert!(!exec.partial_failure);
    assert!(exec.finished_at.is_some());
    assert_eq!(exec.count(NodeStatus::Completed), 4);

    let d = h.engine.get_output(id, "d").await.unwrap().unwrap();
    assert_eq!(d.source, ContractSource::Computed);
    assert_eq!(d.get("seed"), Some(&json!(7)));
    assert_eq!(d.get("left"), Some(&json!(true)));
    assert_eq!(d.get("right"), Some(&json!(true)));
    assert_eq!(h.engine.get_all_outputs(id).await.unwrap().len(), 4);

    let stats = h.engine.get_statistics(id).await.unwrap();
    assert_eq!(stats.count(NodeStatus::Completed), 4);
    assert_eq!(stats.total_attempts, 4);
    assert!(stats.retried_nodes.is_empty());

    let logs = h.engine.get_logs(id, 0, 100).await.unwrap();
    assert!(logs.first().unwrap().message.contains("started by alice"));
    assert!(logs.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(h.engine.list_active_executions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_diamond_with_skipped_branch_merges_default_output() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("diamond-skip");
    workflow.add_node(echo("a"));
    workflow.add_node(echo("b").with_config("set", json!({"left": true})));
    workflow.add_node(NodeSpec::interaction("c", "Check").with_default_output("right", "default"));
    workflow.add_node(echo("d"));
    workflow.connect("a", "b");
    workflow.connect("a", "c");
    workflow.connect("b", "d");
    workflow.connect("c", "d");
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, context(&[("seed", json!(7))]), "alice")
        .await
        .unwrap();
    node_reached(&h.engine, id, "b", NodeStatus::Completed).await;
    let waiting = node_reached(&h.engine, id, "c", NodeStatus::WaitingForInput).await;
    assert_eq!(waiting.node_status("d"), Some(NodeStatus::Pending));
    let interaction_id = waiting.node("c").unwrap().interaction_id.unwrap();

    h.engine.skip_node(id, "c", "not needed", "ops").await.unwrap();
    let exec = finished(&h.engine, id).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.node_status("c"), Some(NodeStatus::Skipped));
    let d = h.engine.get_output(id, "d").await.unwrap().unwrap();
    assert_eq!(d.get("left"), Some(&json!(true)));
    assert_eq!(d.get("right"), Some(&json!("default")));
    let c = h.engine.get_output(id, "c").await.unwrap().unwrap();
    assert!(c.is_default());

    let session = h.engine.get_interaction(interaction_id).await.unwrap();
    assert_eq!(session.status, InteractionStatus::Cancelled);
}

#[tokio::test]
async fn test_pause_then_resume_leaves_state_unchanged() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("pause-noop");
    workflow.add_node(sleep("slow", 200));
    workflow.add_node(echo("next"));
    workflow.connect("slow", "next");
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    let before = node_reached(&h.engine, id, "slow", NodeStatus::Running).await;

    h.engine.pause(id, "alice").await.unwrap();
    h.engine.resume(id, "alice").await.unwrap();
    let after = h.engine.get_status(id).await.unwrap();

    assert_eq!(after.status, before.status);
    assert_eq!(after.node_status("slow"), before.node_status("slow"));
    assert_eq!(after.node_status("next"), before.node_status("next"));
    assert_eq!(finished(&h.engine, id).await.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_edge_mapping_and_untaken_branch() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("branches");
    workflow.add_node(echo("check").with_config("set", json!({"approved": false, "amount": 5})));
    workflow.add_node(echo("yes"));
    workflow.add_node(echo("no"));
    workflow.add_edge(
        Edge::new("check", "yes")
            .map("total", "amount")
            .when(loomcore::EdgeCondition::Truthy { key: "approved".into() }),
    );
    workflow.add_edge(
        Edge::new("check", "no").when(loomcore::EdgeCondition::Equals {
            key: "approved".into(),
            value: json!(false),
        }),
    );
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    let exec = finished(&h.engine, id).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.node_status("yes"), Some(NodeStatus::Skipped));
    assert_eq!(exec.node("yes").unwrap().skip_reason.as_deref(), Some("branch not taken"));
    assert_eq!(exec.node_status("no"), Some(NodeStatus::Completed));
    assert_eq!(
        exec.node("no").unwrap().output.as_ref().unwrap().get("amount"),
        Some(&json!(5))
    );
}

#[tokio::test]
async fn test_halting_failure_fails_execution() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("halting");
    workflow.add_node(NodeSpec::new("bad", "test.flaky"));
    workflow.add_node(echo("after"));
    workflow.add_node(sleep("side", 50));
    workflow.add_node(echo("side_after"));
    workflow.connect("bad", "after");
    workflow.connect("side", "side_after");
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    let exec = finished(&h.engine, id).await;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.node_status("bad"), Some(NodeStatus::Failed));
    assert_eq!(exec.node_status("after"), Some(NodeStatus::SkippedUpstream));
    // Already running when the failure landed, so it drains normally.
    assert_eq!(exec.node_status("side"), Some(NodeStatus::Completed));
    assert_eq!(exec.node_status("side_after"), Some(NodeStatus::SkippedUpstream));
    assert_eq!(
        exec.node("after").unwrap().skip_reason.as_deref(),
        Some("upstream node bad failed")
    );
    assert_eq!(
        exec.node("side_after").unwrap().skip_reason.as_deref(),
        Some("execution halted by failure of bad")
    );

    let error = exec.node("bad").unwrap().error.clone().unwrap();
    assert!(matches!(error.error, NodeError::ExecutionFailed(_)));
    assert_eq!(error.attempt, 1);
}

#[tokio::test]
async fn test_tolerated_failure_completes_with_partial_failure() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("tolerant").with_settings(WorkflowSettings {
        on_error: ErrorHandling::ContinueOnError,
        ..WorkflowSettings::default()
    });
    workflow.add_node(echo("root"));
    workflow.add_node(NodeSpec::new("bad", "test.flaky"));
    workflow.add_node(echo("after_bad"));
    workflow.add_node(echo("good"));
    workflow.connect("root", "bad");
    workflow.connect("bad", "after_bad");
    workflow.connect("root", "good");
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    let exec = finished(&h.engine, id).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert!(exec.partial_failure);
    assert_eq!(exec.node_status("after_bad"), Some(NodeStatus::SkippedUpstream));
    assert_eq!(exec.node_status("good"), Some(NodeStatus::Completed));
    assert!(h.engine.get_statistics(id).await.unwrap().partial_failure);
}

#[tokio::test]
async fn test_retry_is_bounded() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("retry");
    workflow.add_node(NodeSpec::new("bad", "test.flaky").with_retry(2));
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    assert_eq!(finished(&h.engine, id).await.status, ExecutionStatus::Failed);

    let outcome = h.engine.retry_node(id, "bad", "alice").await.unwrap();
    assert_eq!(outcome.execution_id, id);
    let exec = finished(&h.engine, id).await;
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.node("bad").unwrap().attempts, 2);

    let err = h.engine.retry_node(id, "bad", "alice").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::RetryLimitExceeded { max_attempts: 2, .. }
    ));
    assert_eq!(err.kind(), "retry_limit_exceeded");
}

#[tokio::test]
async fn test_retry_reopens_failed_execution() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("retry-ok");
    workflow.add_node(
        NodeSpec::new("flaky", "test.flaky").with_config("succeed_on_attempt", 2),
    );
    workflow.add_node(echo("after"));
    workflow.connect("flaky", "after");
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, context(&[("x", json!(1))]), "alice")
        .await
        .unwrap();
    let failed = finished(&h.engine, id).await;
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.node_status("after"), Some(NodeStatus::SkippedUpstream));

    // Only failed nodes can be retried
    let err = h.engine.retry_node(id, "after", "alice").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::ConcurrencyConflict(ConflictError::Node { .. })
    ));

    h.engine.retry_node(id, "flaky", "alice").await.unwrap();
    let exec = finished(&h.engine, id).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert!(exec.finished_at.is_some());
    let flaky = exec.node("flaky").unwrap();
    assert_eq!(flaky.attempts, 2);
    assert!(flaky.error.is_none());
    assert_eq!(flaky.input.as_ref().unwrap().get("x"), Some(&json!(1)));
    assert_eq!(exec.node_status("after"), Some(NodeStatus::Completed));
    assert_eq!(
        h.engine.get_statistics(id).await.unwrap().retried_nodes,
        vec!["flaky".to_string()]
    );
}

#[tokio::test]
async fn test_skip_failed_node_uses_default_output() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("skip");
    workflow.add_node(
        NodeSpec::new("bad", "test.flaky").with_default_output("value", "fallback"),
    );
    workflow.add_node(echo("after"));
    workflow.connect("bad", "after");
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    assert_eq!(finished(&h.engine, id).await.status, ExecutionStatus::Failed);

    let outcome = h
        .engine
        .skip_node(id, "bad", "known outage", "ops")
        .await
        .unwrap();
    assert_eq!(outcome.node, Some(("bad".to_string(), NodeStatus::Skipped)));

    let exec = finished(&h.engine, id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    let after = exec.node("after").unwrap().output.clone().unwrap();
    assert_eq!(after.get("value"), Some(&json!("fallback")));

    // Completed executions reject further control
    let err = h.engine.skip_node(id, "bad", "again", "ops").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::ConcurrencyConflict(ConflictError::Execution { .. })
    ));
}

#[tokio::test]
async fn test_skip_rules() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("skip-rules");
    workflow.add_node(echo("a"));
    workflow.add_node(sleep("slow", 5_000));
    workflow.add_node(echo("pending"));
    workflow.connect("slow", "pending");
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    node_reached(&h.engine, id, "a", NodeStatus::Completed).await;

    let err = h.engine.skip_node(id, "a", "no", "ops").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::ConcurrencyConflict(ConflictError::Node {
            status: NodeStatus::Completed,
            ..
        })
    ));
    let err = h.engine.skip_node(id, "slow", "no", "ops").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::ConcurrencyConflict(ConflictError::Node {
            status: NodeStatus::Running,
            ..
        })
    ));

    let first = h.engine.skip_node(id, "pending", "not needed", "ops").await.unwrap();
    let second = h.engine.skip_node(id, "pending", "not needed", "ops").await.unwrap();
    assert_eq!(first.node, Some(("pending".to_string(), NodeStatus::Skipped)));
    assert_eq!(first, second);

    let err = h.engine.skip_node(id, "ghost", "no", "ops").await.unwrap_err();
    assert!(matches!(err, EngineError::NodeNotFound { .. }));

    h.engine.cancel(id, "ops").await.unwrap();
}

#[tokio::test]
async fn test_pause_blocks_dispatch_until_resume() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("pause");
    workflow.add_node(sleep("first", 100));
    workflow.add_node(echo("second"));
    workflow.connect("first", "second");
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    let paused = h.engine.pause(id, "alice").await.unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    // Idempotent
    assert_eq!(
        h.engine.pause(id, "alice").await.unwrap().status,
        ExecutionStatus::Paused
    );

    let exec = node_reached(&h.engine, id, "second", NodeStatus::Ready).await;
    assert_eq!(exec.status, ExecutionStatus::Paused);
    assert_eq!(exec.node_status("first"), Some(NodeStatus::Completed));

    h.engine.resume(id, "alice").await.unwrap();
    let exec = finished(&h.engine, id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.count(NodeStatus::Completed), 2);
}

#[tokio::test]
async fn test_execute_node_bypasses_pause() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("manual");
    workflow.add_node(sleep("first", 50));
    workflow.add_node(echo("second"));
    workflow.add_node(echo("third"));
    workflow.connect("first", "second");
    workflow.connect("second", "third");
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    h.engine.pause(id, "alice").await.unwrap();

    let err = h.engine.execute_node(id, "third", "alice").await.unwrap_err();
    match err {
        EngineError::ConcurrencyConflict(ConflictError::NotReady { waiting_on, .. }) => {
            assert_eq!(waiting_on, vec!["second".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }

    node_reached(&h.engine, id, "second", NodeStatus::Ready).await;
    h.engine.execute_node(id, "second", "alice").await.unwrap();
    let exec = node_reached(&h.engine, id, "second", NodeStatus::Completed).await;

    assert_eq!(exec.status, ExecutionStatus::Paused);
    assert_eq!(exec.node_status("third"), Some(NodeStatus::Ready));

    h.engine.resume(id, "alice").await.unwrap();
    assert_eq!(finished(&h.engine, id).await.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_cancel_is_terminal() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("cancel");
    workflow.add_node(sleep("slow", 10_000));
    workflow.add_node(echo("after"));
    workflow.connect("slow", "after");
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    let mut events = h.engine.subscribe_events();

    let outcome = h.engine.cancel(id, "ops").await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Cancelled);

    let exec = finished(&h.engine, id).await;
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert_eq!(exec.node_status("slow"), Some(NodeStatus::Cancelled));
    assert_eq!(exec.node_status("after"), Some(NodeStatus::Cancelled));

    let event = events.recv().await.unwrap();
    assert_eq!(event.execution_id(), id);

    // A second cancel is a no-op; everything else is refused.
    assert_eq!(
        h.engine.cancel(id, "ops").await.unwrap().status,
        ExecutionStatus::Cancelled
    );
    for err in [
        h.engine.pause(id, "ops").await.unwrap_err(),
        h.engine.resume(id, "ops").await.unwrap_err(),
        h.engine.retry_node(id, "slow", "ops").await.unwrap_err(),
        h.engine.skip_node(id, "after", "late", "ops").await.unwrap_err(),
        h.engine.execute_node(id, "after", "ops").await.unwrap_err(),
    ] {
        assert!(matches!(
            err,
            EngineError::ConcurrencyConflict(ConflictError::Execution {
                status: ExecutionStatus::Cancelled,
                ..
            })
        ));
    }

    // The in-flight attempt reports back as a stale result and changes nothing.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let exec = h.engine.get_status(id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert_eq!(exec.node_status("slow"), Some(NodeStatus::Cancelled));
}

#[tokio::test]
async fn test_completed_execution_cannot_be_cancelled() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("done");
    workflow.add_node(echo("only"));
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    reached(&h.engine, id, ExecutionStatus::Completed).await;

    let err = h.engine.cancel(id, "ops").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::ConcurrencyConflict(ConflictError::Execution {
            status: ExecutionStatus::Completed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_node_timeout_from_settings() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("timeout").with_settings(WorkflowSettings {
        node_timeout_ms: Some(20),
        ..WorkflowSettings::default()
    });
    workflow.add_node(sleep("slow", 5_000).with_failure_policy(FailurePolicy::Fail));
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    let exec = finished(&h.engine, id).await;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(
        exec.node("slow").unwrap().error.as_ref().unwrap().error,
        NodeError::Timeout { millis: 20 }
    );
}

#[tokio::test]
async fn test_concurrency_limit() {
    let h = harness();
    let mut workflow = WorkflowGraph::new("limit").with_settings(WorkflowSettings {
        max_parallel_nodes: Some(1),
        ..WorkflowSettings::default()
    });
    workflow.add_node(sleep("one", 80));
    workflow.add_node(sleep("two", 80));
    let workflow_id = h.catalog.register_workflow(workflow).await;

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    let exec = h.engine.get_status(id).await.unwrap();
    assert_eq!(exec.count(NodeStatus::Running), 1);
    assert_eq!(exec.node_status("two"), Some(NodeStatus::Ready));

    assert_eq!(finished(&h.engine, id).await.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_start_rejects_invalid_workflows() {
    let h = harness();

    let err = h
        .engine
        .start_execution(Uuid::new_v4(), HashMap::new(), "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WorkflowNotFound(_)));
    assert_eq!(err.kind(), "not_found");

    let mut cyclic = WorkflowGraph::new("cyclic");
    cyclic.add_node(echo("a"));
    cyclic.add_node(echo("b"));
    cyclic.connect("a", "b");
    cyclic.connect("b", "a");
    let cyclic_id = h.catalog.register_workflow(cyclic).await;
    let err = h
        .engine
        .start_execution(cyclic_id, HashMap::new(), "alice")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");

    let mut unknown = WorkflowGraph::new("unknown");
    unknown.add_node(NodeSpec::new("a", "test.missing"));
    let unknown_id = h.catalog.register_workflow(unknown).await;
    let err = h
        .engine
        .start_execution(unknown_id, HashMap::new(), "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    assert!(matches!(
        h.engine.get_status(Uuid::new_v4()).await,
        Err(EngineError::ExecutionNotFound(_))
    ));
}
