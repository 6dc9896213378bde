mod common;

use common::{finished, harness, harness_with, reached};
use loomcore::{
    ConflictError, ContractSource, EngineError, ExecutionStatus, InteractionStatus, NodeError,
    NodeSpec, NodeStatus, WorkflowGraph, WorkflowId,
};
use loomruntime::{EngineConfig, MemoryStore};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn data(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    common::context(pairs)
}

/// prepare -> approve (human) -> ship
async fn approval_workflow(h: &common::Harness, approve: NodeSpec) -> WorkflowId {
    let mut workflow = WorkflowGraph::new("approval");
    workflow.add_node(
        NodeSpec::new("prepare", "test.echo").with_config("set", json!({"order": 42})),
    );
    workflow.add_node(approve);
    workflow.add_node(NodeSpec::new("ship", "test.echo"));
    workflow.connect("prepare", "approve");
    workflow.connect("approve", "ship");
    h.catalog.register_workflow(workflow).await
}

fn approve_node() -> NodeSpec {
    NodeSpec::interaction("approve", "Approve order")
        .with_config("input_schema", json!({"required": ["approved"]}))
}

#[tokio::test]
async fn test_ui_interaction_round_trip() {
    let h = harness();
    let workflow_id = approval_workflow(&h, approve_node()).await;

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    let exec = reached(&h.engine, id, ExecutionStatus::WaitingForInput).await;
    assert_eq!(exec.node_status("approve"), Some(NodeStatus::WaitingForInput));
    assert_eq!(exec.node_status("ship"), Some(NodeStatus::Pending));

    let pending = h
        .engine
        .list_pending_interactions_for_user("alice")
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    let session = &pending[0];
    assert_eq!(Some(session.id), exec.node("approve").unwrap().interaction_id);
    assert_eq!(session.title, "Approve order");
    assert_eq!(session.context["inputs"]["order"], json!(42));
    assert!(h
        .engine
        .list_pending_interactions_for_user("bob")
        .await
        .unwrap()
        .is_empty());

    // Missing required field: rejected, session untouched
    let err = h
        .engine
        .complete_ui_interaction(id, "approve", session.id, HashMap::new(), "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidSubmission { .. }));
    assert_eq!(err.kind(), "validation");

    // Wrong node for this session
    let err = h
        .engine
        .complete_ui_interaction(id, "ship", session.id, data(&[("approved", json!(true))]), "alice")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::ConcurrencyConflict(ConflictError::InteractionMismatch { .. })
    ));

    let outcome = h
        .engine
        .complete_ui_interaction(
            id,
            "approve",
            session.id,
            data(&[("approved", json!(true)), ("note", json!("ok"))]),
            "alice",
        )
        .await
        .unwrap();
    assert_eq!(outcome.node, Some(("approve".to_string(), NodeStatus::Completed)));

    let exec = finished(&h.engine, id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);

    let approve = h.engine.get_output(id, "approve").await.unwrap().unwrap();
    assert_eq!(approve.source, ContractSource::Interaction);
    let ship = h.engine.get_output(id, "ship").await.unwrap().unwrap();
    assert_eq!(ship.get("approved"), Some(&json!(true)));

    let stored = h.engine.get_interaction(session.id).await.unwrap();
    assert_eq!(stored.status, InteractionStatus::Completed);
    assert_eq!(stored.responded_by.as_deref(), Some("alice"));
    assert!(stored.completed_at.is_some());
    assert_eq!(
        h.engine.list_interactions_for_execution(id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_double_submit_is_rejected() {
    let h = harness();
    let workflow_id = approval_workflow(&h, approve_node()).await;
    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    reached(&h.engine, id, ExecutionStatus::WaitingForInput).await;
    let session = h.engine.list_interactions_for_execution(id).await.unwrap()[0].clone();

    let first = data(&[("approved", json!(true))]);
    h.engine
        .submit_interaction(session.id, first.clone(), "alice")
        .await
        .unwrap();
    let err = h
        .engine
        .submit_interaction(session.id, data(&[("approved", json!(false))]), "bob")
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::InteractionUnavailable { .. }));
    let stored = h.engine.get_interaction(session.id).await.unwrap();
    assert_eq!(stored.responded_by.as_deref(), Some("alice"));
    assert_eq!(stored.output, Some(first.clone()));

    let exec = finished(&h.engine, id).await;
    let approve = exec.node("approve").unwrap().output.clone().unwrap();
    assert_eq!(approve.data, first);
}

#[tokio::test]
async fn test_cancelled_interaction_fails_node_by_default() {
    let h = harness();
    let workflow_id = approval_workflow(&h, approve_node()).await;
    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    reached(&h.engine, id, ExecutionStatus::WaitingForInput).await;
    let session = h.engine.list_interactions_for_execution(id).await.unwrap()[0].clone();

    h.engine
        .cancel_interaction(session.id, "alice", "not my call")
        .await
        .unwrap();
    let exec = finished(&h.engine, id).await;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(
        exec.node("approve").unwrap().error.as_ref().unwrap().error,
        NodeError::InteractionCancelled {
            user_id: "alice".into(),
            reason: "not my call".into()
        }
    );
    assert_eq!(exec.node_status("ship"), Some(NodeStatus::SkippedUpstream));

    let err = h
        .engine
        .cancel_interaction(session.id, "alice", "again")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InteractionUnavailable {
            status: InteractionStatus::Cancelled,
            ..
        }
    ));

    // A retry opens a fresh session for the next attempt.
    h.engine.retry_node(id, "approve", "alice").await.unwrap();
    let exec = reached(&h.engine, id, ExecutionStatus::WaitingForInput).await;
    let approve = exec.node("approve").unwrap();
    assert_eq!(approve.attempts, 2);
    assert_ne!(approve.interaction_id, Some(session.id));
    assert_eq!(
        h.engine.list_interactions_for_execution(id).await.unwrap().len(),
        2
    );
    h.engine.cancel(id, "alice").await.unwrap();
}

#[tokio::test]
async fn test_cancelled_interaction_can_skip_node() {
    let h = harness();
    let approve = approve_node()
        .with_config("on_cancel", "skip")
        .with_default_output("approved", false);
    let workflow_id = approval_workflow(&h, approve).await;
    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    reached(&h.engine, id, ExecutionStatus::WaitingForInput).await;
    let session = h.engine.list_interactions_for_execution(id).await.unwrap()[0].clone();

    h.engine
        .cancel_interaction(session.id, "alice", "skip it")
        .await
        .unwrap();
    let exec = finished(&h.engine, id).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.node_status("approve"), Some(NodeStatus::Skipped));
    let ship = exec.node("ship").unwrap().output.clone().unwrap();
    assert_eq!(ship.get("approved"), Some(&json!(false)));
}

#[tokio::test]
async fn test_timeout_sweep_is_idempotent() {
    let h = harness();
    let approve = approve_node().with_config("timeout_secs", 0);
    let workflow_id = approval_workflow(&h, approve).await;
    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    reached(&h.engine, id, ExecutionStatus::WaitingForInput).await;
    let session = h.engine.list_interactions_for_execution(id).await.unwrap()[0].clone();

    // Overdue but not swept yet
    let err = h
        .engine
        .submit_interaction(session.id, data(&[("approved", json!(true))]), "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout { .. }));

    let (first, second) = tokio::join!(
        h.engine.process_timed_out_interactions(),
        h.engine.process_timed_out_interactions()
    );
    assert_eq!(first.unwrap() + second.unwrap(), 1);
    assert_eq!(h.engine.process_timed_out_interactions().await.unwrap(), 0);

    let exec = finished(&h.engine, id).await;
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(
        exec.node("approve").unwrap().error.as_ref().unwrap().error,
        NodeError::InteractionTimedOut
    );
    assert_eq!(
        h.engine.get_interaction(session.id).await.unwrap().status,
        InteractionStatus::TimedOut
    );
}

#[tokio::test]
async fn test_sweeper_task_applies_skip_fallback() {
    let config = EngineConfig {
        default_interaction_timeout: Some(Duration::from_millis(10)),
        ..EngineConfig::default()
    };
    let h = harness_with(Arc::new(MemoryStore::new()), config);
    let approve = approve_node().with_config("on_timeout", "skip");
    let workflow_id = approval_workflow(&h, approve).await;

    let shutdown = CancellationToken::new();
    let sweeper = h
        .engine
        .spawn_timeout_sweeper(Duration::from_millis(20), shutdown.clone());

    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    let exec = finished(&h.engine, id).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.node_status("approve"), Some(NodeStatus::Skipped));
    assert_eq!(
        exec.node("approve").unwrap().skip_reason.as_deref(),
        Some("interaction timed out")
    );

    shutdown.cancel();
    sweeper.await.unwrap();
}

#[tokio::test]
async fn test_cancel_execution_closes_sessions() {
    let h = harness();
    let workflow_id = approval_workflow(&h, approve_node()).await;
    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    reached(&h.engine, id, ExecutionStatus::WaitingForInput).await;
    let session = h.engine.list_interactions_for_execution(id).await.unwrap()[0].clone();

    h.engine.cancel(id, "ops").await.unwrap();

    let stored = h.engine.get_interaction(session.id).await.unwrap();
    assert_eq!(stored.status, InteractionStatus::Cancelled);
    assert!(h
        .engine
        .list_pending_interactions_for_user("alice")
        .await
        .unwrap()
        .is_empty());

    let err = h
        .engine
        .submit_interaction(session.id, data(&[("approved", json!(true))]), "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InteractionUnavailable { .. }));
}

#[tokio::test]
async fn test_pause_while_waiting_for_input() {
    let h = harness();
    let workflow_id = approval_workflow(&h, approve_node()).await;
    let id = h
        .engine
        .start_execution(workflow_id, HashMap::new(), "alice")
        .await
        .unwrap();
    reached(&h.engine, id, ExecutionStatus::WaitingForInput).await;
    let session = h.engine.list_interactions_for_execution(id).await.unwrap()[0].clone();

    h.engine.pause(id, "alice").await.unwrap();
    let outcome = h
        .engine
        .submit_interaction(session.id, data(&[("approved", json!(true))]), "alice")
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Paused);

    let exec = h.engine.get_status(id).await.unwrap();
    assert_eq!(exec.node_status("ship"), Some(NodeStatus::Ready));

    h.engine.resume(id, "alice").await.unwrap();
    assert_eq!(finished(&h.engine, id).await.status, ExecutionStatus::Completed);
}
