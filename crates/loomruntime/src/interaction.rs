//! Lifecycle of human-input sessions.
//!
//! Every status change goes through `ExecutionStore::transition_interaction`,
//! so two callers racing on the same session (a submit against the timeout
//! sweep, a double submit) cannot both win.

use crate::store::ExecutionStore;
use chrono::Utc;
use loomcore::{
    EngineError, ExecutionId, InteractionId, InteractionSpec, InteractionStatus, NodeSpec,
    StoreError, UiInteractionSession, WorkflowExecution,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct InteractionManager {
    store: Arc<dyn ExecutionStore>,
    default_timeout: Option<Duration>,
}

impl InteractionManager {
    pub fn new(store: Arc<dyn ExecutionStore>, default_timeout: Option<Duration>) -> Self {
        Self {
            store,
            default_timeout,
        }
    }

    /// Create a Pending session for one attempt of an interaction node.
    ///
    /// The session context is the node's configured context with the
    /// resolved node input under `inputs`.
    pub async fn open(
        &self,
        exec: &WorkflowExecution,
        node: &NodeSpec,
        attempt: u32,
        inputs: &HashMap<String, Value>,
    ) -> Result<UiInteractionSession, EngineError> {
        let spec = node.interaction_spec()?;
        let now = Utc::now();
        let timeout = spec
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.default_timeout)
            .and_then(|t| chrono::Duration::from_std(t).ok());

        let session = UiInteractionSession {
            id: Uuid::new_v4(),
            workflow_id: exec.workflow_id,
            execution_id: exec.id,
            node_id: node.id.clone(),
            attempt,
            assignee: spec
                .assignee
                .clone()
                .unwrap_or_else(|| exec.triggered_by.clone()),
            title: spec.title.clone(),
            description: spec.description.clone(),
            input_schema: spec.input_schema.clone(),
            context: session_context(&spec, inputs),
            status: InteractionStatus::Pending,
            output: None,
            responded_by: None,
            cancel_reason: None,
            created_at: now,
            timeout_at: timeout.map(|t| now + t),
            completed_at: None,
        };

        self.store.insert_interaction(&session).await?;
        tracing::info!(
            interaction_id = %session.id,
            execution_id = %exec.id,
            node_id = %node.id,
            assignee = %session.assignee,
            "Opened interaction"
        );
        Ok(session)
    }

    pub async fn get(&self, id: InteractionId) -> Result<UiInteractionSession, EngineError> {
        self.store
            .load_interaction(id)
            .await?
            .ok_or(EngineError::InteractionNotFound(id))
    }

    pub async fn pending_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<UiInteractionSession>, EngineError> {
        Ok(self.store.pending_interactions_for_user(user_id).await?)
    }

    pub async fn for_execution(
        &self,
        id: ExecutionId,
    ) -> Result<Vec<UiInteractionSession>, EngineError> {
        Ok(self.store.interactions_for_execution(id).await?)
    }

    pub async fn overdue(&self) -> Result<Vec<UiInteractionSession>, EngineError> {
        Ok(self.store.overdue_interactions(Utc::now()).await?)
    }

    /// Accept a response: Pending -> Submitted.
    pub async fn submit(
        &self,
        id: InteractionId,
        data: HashMap<String, Value>,
        user_id: &str,
    ) -> Result<UiInteractionSession, EngineError> {
        let session = self.get(id).await?;
        if !session.is_pending() {
            return Err(EngineError::InteractionUnavailable {
                id,
                status: session.status,
            });
        }
        // Past its deadline but not swept yet
        if session.is_overdue(Utc::now()) {
            return Err(EngineError::Timeout { id });
        }
        validate_submission(&session, &data)?;

        let mut next = session;
        next.status = InteractionStatus::Submitted;
        next.output = Some(data);
        next.responded_by = Some(user_id.to_string());
        self.transition(InteractionStatus::Pending, next).await
    }

    /// Submitted -> Completed, once the node has taken the output.
    pub async fn complete(
        &self,
        session: UiInteractionSession,
    ) -> Result<UiInteractionSession, EngineError> {
        let mut next = session;
        next.status = InteractionStatus::Completed;
        next.completed_at = Some(Utc::now());
        self.transition(InteractionStatus::Submitted, next).await
    }

    /// Pending -> Cancelled.
    pub async fn cancel(
        &self,
        id: InteractionId,
        user_id: &str,
        reason: &str,
    ) -> Result<UiInteractionSession, EngineError> {
        let mut next = self.get(id).await?;
        next.status = InteractionStatus::Cancelled;
        next.responded_by = Some(user_id.to_string());
        next.cancel_reason = Some(reason.to_string());
        next.completed_at = Some(Utc::now());
        self.transition(InteractionStatus::Pending, next).await
    }

    /// Pending -> TimedOut.
    pub async fn time_out(
        &self,
        session: UiInteractionSession,
    ) -> Result<UiInteractionSession, EngineError> {
        let mut next = session;
        next.status = InteractionStatus::TimedOut;
        next.completed_at = Some(Utc::now());
        self.transition(InteractionStatus::Pending, next).await
    }

    /// Cancel a session on behalf of the engine if it is still Pending.
    /// Sessions already resolved are left alone.
    pub async fn close(&self, id: InteractionId, reason: &str) -> Result<(), EngineError> {
        match self.cancel(id, "system", reason).await {
            Ok(_) | Err(EngineError::InteractionUnavailable { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn transition(
        &self,
        expected: InteractionStatus,
        next: UiInteractionSession,
    ) -> Result<UiInteractionSession, EngineError> {
        match self.store.transition_interaction(expected, &next).await {
            Ok(()) => {
                tracing::debug!(
                    interaction_id = %next.id,
                    from = ?expected,
                    to = ?next.status,
                    "Interaction transition"
                );
                Ok(next)
            }
            Err(StoreError::InteractionConflict { id, actual, .. }) => {
                Err(EngineError::InteractionUnavailable { id, status: actual })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Every key listed under the schema's `required` array must be present.
pub fn validate_submission(
    session: &UiInteractionSession,
    data: &HashMap<String, Value>,
) -> Result<(), EngineError> {
    let Some(required) = session.input_schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    let missing: Vec<&str> = required
        .iter()
        .filter_map(Value::as_str)
        .filter(|key| !data.contains_key(*key))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(EngineError::InvalidSubmission {
            id: session.id,
            message: format!("missing required fields: {}", missing.join(", ")),
        })
    }
}

fn session_context(spec: &InteractionSpec, inputs: &HashMap<String, Value>) -> Value {
    let mut context = match &spec.context {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => Map::from_iter([("value".to_string(), other.clone())]),
    };
    context.insert(
        "inputs".to_string(),
        Value::Object(inputs.clone().into_iter().collect()),
    );
    Value::Object(context)
}
