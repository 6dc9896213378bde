//! Public control surface of the runtime.
//!
//! Every operation that changes an execution runs under that execution's
//! slot lock, re-validates the record it finds there, persists the result
//! and only then publishes events. Node attempts run as detached tasks and
//! report back through the same lock; a result whose attempt number no
//! longer matches the record is dropped.

use crate::config::{EngineConfig, RecoveryPolicy};
use crate::executor::{AttemptResult, NodeExecutor, NodeJob};
use crate::graph::ExecutionGraph;
use crate::interaction::InteractionManager;
use crate::registry::NodeRegistry;
use crate::scheduler;
use crate::source::{WorkflowCatalog, WorkflowSource};
use crate::stats::ExecutionStatistics;
use crate::store::{ExecutionStore, MemoryStore};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use loomcore::{
    ConflictError, EngineError, EventBus, ExecutionEvent, ExecutionId, ExecutionLogEntry,
    ExecutionStatus, InteractionFallback, InteractionId, InteractionStatus, LogLevel, NodeError,
    NodeErrorInfo, NodeId, NodeStatus, UiInteractionSession, WorkflowDataContract,
    WorkflowExecution, WorkflowGraph, WorkflowId,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result of a control operation
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ControlOutcome {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    /// The node the operation targeted, with its status afterwards
    pub node: Option<(NodeId, NodeStatus)>,
}

impl ControlOutcome {
    fn of(exec: &WorkflowExecution, node_id: Option<&str>) -> Self {
        Self {
            execution_id: exec.id,
            status: exec.status,
            node: node_id.and_then(|id| exec.node_status(id).map(|s| (id.to_string(), s))),
        }
    }
}

/// Why an interaction stopped waiting without a submission
enum Unanswered {
    Cancelled { user_id: String, reason: String },
    TimedOut,
}

struct SlotState {
    exec: WorkflowExecution,
    /// Set when the slot left the registry; holders must fetch a fresh one
    retired: bool,
    /// Set once this process has dispatched for the execution; recovery
    /// leaves owned executions alone
    owned: bool,
}

/// Single-writer home of one execution
struct ExecutionSlot {
    graph: Arc<ExecutionGraph>,
    cancellation: CancellationToken,
    status_tx: watch::Sender<ExecutionStatus>,
    state: Arc<Mutex<SlotState>>,
}

impl ExecutionSlot {
    fn new(graph: Arc<ExecutionGraph>, exec: WorkflowExecution) -> Self {
        let cancellation = CancellationToken::new();
        if exec.status == ExecutionStatus::Cancelled {
            cancellation.cancel();
        }
        let (status_tx, _) = watch::channel(exec.status);
        Self {
            graph,
            cancellation,
            status_tx,
            state: Arc::new(Mutex::new(SlotState {
                exec,
                retired: false,
                owned: false,
            })),
        }
    }
}

type Guard = OwnedMutexGuard<SlotState>;

struct EngineInner {
    config: EngineConfig,
    workflows: Arc<dyn WorkflowSource>,
    store: Arc<dyn ExecutionStore>,
    events: Arc<EventBus>,
    interactions: InteractionManager,
    executor: NodeExecutor,
    slots: RwLock<HashMap<ExecutionId, Arc<ExecutionSlot>>>,
}

/// Workflow execution engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

pub struct WorkflowEngineBuilder {
    config: EngineConfig,
    registry: Option<Arc<NodeRegistry>>,
    workflows: Option<Arc<dyn WorkflowSource>>,
    store: Option<Arc<dyn ExecutionStore>>,
}

impl WorkflowEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn workflows(mut self, workflows: Arc<dyn WorkflowSource>) -> Self {
        self.workflows = Some(workflows);
        self
    }

    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let registry = self.registry.unwrap_or_default();
        let workflows = self
            .workflows
            .unwrap_or_else(|| Arc::new(WorkflowCatalog::new()));
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let events = Arc::new(EventBus::new(self.config.event_buffer_size));

        WorkflowEngine {
            inner: Arc::new(EngineInner {
                interactions: InteractionManager::new(
                    store.clone(),
                    self.config.default_interaction_timeout,
                ),
                executor: NodeExecutor::new(registry, events.clone()),
                config: self.config,
                workflows,
                store,
                events,
                slots: RwLock::new(HashMap::new()),
            }),
        }
    }
}

impl WorkflowEngine {
    pub fn builder() -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            config: EngineConfig::default(),
            registry: None,
            workflows: None,
            store: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        self.inner.executor.registry()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    /// Full structural and registry validation of a workflow.
    pub fn validate_workflow(&self, workflow: &WorkflowGraph) -> Result<ExecutionGraph, EngineError> {
        self.inner.validate(workflow)
    }

    pub async fn start_execution(
        &self,
        workflow_id: WorkflowId,
        trigger_context: HashMap<String, Value>,
        user_id: &str,
    ) -> Result<ExecutionId, EngineError> {
        self.inner
            .start_execution(workflow_id, trigger_context, user_id)
            .await
    }

    pub async fn get_status(&self, id: ExecutionId) -> Result<WorkflowExecution, EngineError> {
        self.inner.load(id).await
    }

    pub async fn pause(&self, id: ExecutionId, user_id: &str) -> Result<ControlOutcome, EngineError> {
        self.inner.pause(id, user_id).await
    }

    pub async fn resume(&self, id: ExecutionId, user_id: &str) -> Result<ControlOutcome, EngineError> {
        self.inner.resume(id, user_id).await
    }

    pub async fn cancel(&self, id: ExecutionId, user_id: &str) -> Result<ControlOutcome, EngineError> {
        self.inner.cancel(id, user_id).await
    }

    /// Dispatch one node whose dependencies are satisfied, even while the
    /// execution is paused.
    pub async fn execute_node(
        &self,
        id: ExecutionId,
        node_id: &str,
        user_id: &str,
    ) -> Result<ControlOutcome, EngineError> {
        self.inner.execute_node(id, node_id, user_id).await
    }

    pub async fn retry_node(
        &self,
        id: ExecutionId,
        node_id: &str,
        user_id: &str,
    ) -> Result<ControlOutcome, EngineError> {
        self.inner.retry_node(id, node_id, user_id).await
    }

    pub async fn skip_node(
        &self,
        id: ExecutionId,
        node_id: &str,
        reason: &str,
        user_id: &str,
    ) -> Result<ControlOutcome, EngineError> {
        self.inner.skip_node(id, node_id, reason, user_id).await
    }

    /// Resume a suspended node with the data a human submitted for it.
    pub async fn complete_ui_interaction(
        &self,
        id: ExecutionId,
        node_id: &str,
        interaction_id: InteractionId,
        output: HashMap<String, Value>,
        user_id: &str,
    ) -> Result<ControlOutcome, EngineError> {
        let session = self.inner.interactions.get(interaction_id).await?;
        if session.execution_id != id || session.node_id != node_id {
            return Err(ConflictError::InteractionMismatch {
                interaction_id,
                node_id: node_id.to_string(),
            }
            .into());
        }
        self.inner
            .submit_interaction(interaction_id, output, user_id)
            .await
    }

    pub async fn submit_interaction(
        &self,
        interaction_id: InteractionId,
        data: HashMap<String, Value>,
        user_id: &str,
    ) -> Result<ControlOutcome, EngineError> {
        self.inner
            .submit_interaction(interaction_id, data, user_id)
            .await
    }

    pub async fn cancel_interaction(
        &self,
        interaction_id: InteractionId,
        user_id: &str,
        reason: &str,
    ) -> Result<ControlOutcome, EngineError> {
        self.inner
            .cancel_interaction(interaction_id, user_id, reason)
            .await
    }

    /// Time out every overdue Pending session. Returns how many this call
    /// resolved; sessions resolved concurrently are not counted.
    pub async fn process_timed_out_interactions(&self) -> Result<usize, EngineError> {
        self.inner.process_timed_out_interactions().await
    }

    pub async fn get_all_outputs(
        &self,
        id: ExecutionId,
    ) -> Result<HashMap<NodeId, WorkflowDataContract>, EngineError> {
        Ok(self.inner.load(id).await?.outputs())
    }

    pub async fn get_output(
        &self,
        id: ExecutionId,
        node_id: &str,
    ) -> Result<Option<WorkflowDataContract>, EngineError> {
        let exec = self.inner.load(id).await?;
        let node = exec.node(node_id).ok_or_else(|| EngineError::NodeNotFound {
            execution_id: id,
            node_id: node_id.to_string(),
        })?;
        Ok(node.output.clone())
    }

    pub async fn get_statistics(&self, id: ExecutionId) -> Result<ExecutionStatistics, EngineError> {
        let exec = self.inner.load(id).await?;
        Ok(ExecutionStatistics::from_execution(&exec))
    }

    pub async fn get_logs(
        &self,
        id: ExecutionId,
        skip: usize,
        take: usize,
    ) -> Result<Vec<ExecutionLogEntry>, EngineError> {
        self.inner.load(id).await?;
        Ok(self.inner.store.logs(id, skip, take).await?)
    }

    pub async fn list_active_executions(&self) -> Result<Vec<WorkflowExecution>, EngineError> {
        Ok(self.inner.store.list_active().await?)
    }

    pub async fn list_pending_interactions_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<UiInteractionSession>, EngineError> {
        self.inner.interactions.pending_for_user(user_id).await
    }

    pub async fn get_interaction(
        &self,
        interaction_id: InteractionId,
    ) -> Result<UiInteractionSession, EngineError> {
        self.inner.interactions.get(interaction_id).await
    }

    pub async fn list_interactions_for_execution(
        &self,
        id: ExecutionId,
    ) -> Result<Vec<UiInteractionSession>, EngineError> {
        self.inner.interactions.for_execution(id).await
    }

    /// Wait until `done` holds for the execution's status, or it reaches a
    /// terminal status, and return the stored record.
    pub async fn wait_for(
        &self,
        id: ExecutionId,
        done: impl Fn(ExecutionStatus) -> bool,
    ) -> Result<WorkflowExecution, EngineError> {
        loop {
            let mut rx = self.inner.slot(id).await?.status_tx.subscribe();
            loop {
                let status = *rx.borrow_and_update();
                if done(status) || status.is_terminal() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }

            // The slot may have been retired; the store is authoritative.
            let exec = self.inner.load(id).await?;
            if done(exec.status) || exec.is_terminal() {
                return Ok(exec);
            }
        }
    }

    pub async fn wait_for_completion(&self, id: ExecutionId) -> Result<WorkflowExecution, EngineError> {
        self.wait_for(id, |status| status.is_terminal()).await
    }

    /// Resume executions left active by a previous process. Returns how
    /// many were picked up.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        self.inner.recover().await
    }

    /// Run the interaction timeout sweep every `interval` until `shutdown`
    /// is cancelled.
    pub fn spawn_timeout_sweeper(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match engine.process_timed_out_interactions().await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("Timed out {} interactions", n),
                        Err(e) => tracing::warn!("Interaction sweep failed: {}", e),
                    },
                }
            }
            tracing::debug!("Timeout sweeper stopped");
        })
    }
}

impl EngineInner {
    fn validate(&self, workflow: &WorkflowGraph) -> Result<ExecutionGraph, EngineError> {
        let graph = ExecutionGraph::build(workflow.clone())?;
        self.executor.registry().check_workflow(workflow)?;
        Ok(graph)
    }

    async fn load(&self, id: ExecutionId) -> Result<WorkflowExecution, EngineError> {
        self.store
            .load_execution(id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(id))
    }

    /// The registered slot of an execution, created from the store on
    /// first use. Terminal executions get a detached slot; a Failed one is
    /// registered again by `attach` when an operator reopens it.
    async fn slot(&self, id: ExecutionId) -> Result<Arc<ExecutionSlot>, EngineError> {
        if let Some(slot) = self.slots.read().await.get(&id) {
            return Ok(slot.clone());
        }

        let exec = self.load(id).await?;
        let workflow = self
            .workflows
            .get_workflow(exec.workflow_id)
            .await
            .ok_or(EngineError::WorkflowNotFound(exec.workflow_id))?;
        let graph = Arc::new(ExecutionGraph::build(workflow)?);
        let detached = exec.is_terminal();
        let slot = Arc::new(ExecutionSlot::new(graph, exec));
        if detached {
            return Ok(slot);
        }

        let mut slots = self.slots.write().await;
        Ok(slots.entry(id).or_insert(slot).clone())
    }

    /// Register the detached slot of a Failed execution about to reopen.
    /// Fails if another caller reopened it first.
    async fn attach(&self, slot: &Arc<ExecutionSlot>, exec: &WorkflowExecution) -> Result<(), EngineError> {
        let mut slots = self.slots.write().await;
        let same = slots
            .get(&exec.id)
            .map(|registered| Arc::ptr_eq(&registered.state, &slot.state));
        match same {
            Some(true) => return Ok(()),
            Some(false) => {}
            None => {
                let stored = self.load(exec.id).await?;
                if stored.status == exec.status && stored.updated_at == exec.updated_at {
                    slots.insert(exec.id, slot.clone());
                    return Ok(());
                }
            }
        }
        Err(ConflictError::Execution {
            execution_id: exec.id,
            status: exec.status,
        }
        .into())
    }

    async fn lock(&self, id: ExecutionId) -> Result<(Arc<ExecutionSlot>, Guard), EngineError> {
        loop {
            let slot = self.slot(id).await?;
            let guard = slot.state.clone().lock_owned().await;
            if !guard.retired {
                return Ok((slot, guard));
            }
        }
    }

    async fn start_execution(
        self: &Arc<Self>,
        workflow_id: WorkflowId,
        trigger_context: HashMap<String, Value>,
        user_id: &str,
    ) -> Result<ExecutionId, EngineError> {
        let workflow = self
            .workflows
            .get_workflow(workflow_id)
            .await
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        let graph = Arc::new(self.validate(&workflow)?);

        let mut exec = WorkflowExecution::new(&workflow, user_id, trigger_context);
        exec.status = ExecutionStatus::Running;
        exec.started_at = Some(Utc::now());
        self.store.insert_execution(&exec).await?;

        let id = exec.id;
        let slot = Arc::new(ExecutionSlot::new(graph, exec));
        let mut guard = slot.state.clone().lock_owned().await;
        self.slots.write().await.insert(id, slot.clone());

        tracing::info!(execution_id = %id, %workflow_id, "Starting workflow execution");
        self.events.emit(ExecutionEvent::ExecutionStarted {
            execution_id: id,
            workflow_id,
            triggered_by: user_id.to_string(),
            timestamp: Utc::now(),
        });
        self.log(id, None, LogLevel::Info, format!("Execution started by {}", user_id))
            .await;

        self.dispatch(&slot, &mut guard).await?;
        self.commit(&slot, &mut guard).await?;
        Ok(id)
    }

    async fn pause(self: &Arc<Self>, id: ExecutionId, user_id: &str) -> Result<ControlOutcome, EngineError> {
        let (slot, mut guard) = self.lock(id).await?;
        let exec = &mut guard.exec;
        ensure_open(exec)?;
        if exec.status != ExecutionStatus::Paused {
            exec.status = ExecutionStatus::Paused;
            self.log(id, None, LogLevel::Info, format!("Paused by {}", user_id))
                .await;
        }
        self.commit(&slot, &mut guard).await?;
        Ok(ControlOutcome::of(&guard.exec, None))
    }

    async fn resume(self: &Arc<Self>, id: ExecutionId, user_id: &str) -> Result<ControlOutcome, EngineError> {
        let (slot, mut guard) = self.lock(id).await?;
        let exec = &mut guard.exec;
        ensure_open(exec)?;
        if exec.status == ExecutionStatus::Paused {
            exec.status = ExecutionStatus::Running;
            self.log(id, None, LogLevel::Info, format!("Resumed by {}", user_id))
                .await;
            self.dispatch(&slot, &mut guard).await?;
        }
        self.commit(&slot, &mut guard).await?;
        Ok(ControlOutcome::of(&guard.exec, None))
    }

    async fn cancel(self: &Arc<Self>, id: ExecutionId, user_id: &str) -> Result<ControlOutcome, EngineError> {
        let (slot, mut guard) = self.lock(id).await?;
        match guard.exec.status {
            ExecutionStatus::Cancelled => return Ok(ControlOutcome::of(&guard.exec, None)),
            status @ (ExecutionStatus::Completed | ExecutionStatus::Failed) => {
                return Err(ConflictError::Execution {
                    execution_id: id,
                    status,
                }
                .into())
            }
            _ => {}
        }

        // Sessions first: a store failure here leaves the record untouched.
        let waiting: Vec<InteractionId> = guard
            .exec
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::WaitingForInput)
            .filter_map(|n| n.interaction_id)
            .collect();
        for interaction_id in waiting {
            self.interactions
                .close(interaction_id, "execution cancelled")
                .await?;
        }

        slot.cancellation.cancel();
        let exec = &mut guard.exec;
        exec.status = ExecutionStatus::Cancelled;
        exec.finished_at = Some(Utc::now());

        let unfinished: Vec<NodeId> = exec
            .nodes
            .values()
            .filter(|n| n.status.is_unfinished())
            .map(|n| n.node_id.clone())
            .collect();
        for node_id in &unfinished {
            if let Some(node) = exec.node_mut(node_id) {
                node.finish(NodeStatus::Cancelled);
            }
        }

        self.log(
            id,
            None,
            LogLevel::Warn,
            format!("Cancelled by {} ({} nodes unfinished)", user_id, unfinished.len()),
        )
        .await;
        self.commit(&slot, &mut guard).await?;
        Ok(ControlOutcome::of(&guard.exec, None))
    }

    async fn execute_node(
        self: &Arc<Self>,
        id: ExecutionId,
        node_id: &str,
        user_id: &str,
    ) -> Result<ControlOutcome, EngineError> {
        let (slot, mut guard) = self.lock(id).await?;
        let exec = &mut guard.exec;
        ensure_open(exec)?;

        let status = node_status(exec, node_id)?;
        if !matches!(
            status,
            NodeStatus::Pending | NodeStatus::Ready | NodeStatus::Retrying
        ) {
            return Err(ConflictError::Node {
                node_id: node_id.to_string(),
                status,
            }
            .into());
        }
        let waiting_on = scheduler::unmet_dependencies(&slot.graph, exec, node_id);
        if !waiting_on.is_empty() {
            return Err(ConflictError::NotReady {
                node_id: node_id.to_string(),
                waiting_on,
            }
            .into());
        }

        self.log(
            id,
            Some(node_id),
            LogLevel::Info,
            format!("Manual dispatch by {}", user_id),
        )
        .await;
        self.launch(&slot, &mut guard.exec, node_id).await?;
        self.dispatch(&slot, &mut guard).await?;
        self.commit(&slot, &mut guard).await?;
        Ok(ControlOutcome::of(&guard.exec, Some(node_id)))
    }

    async fn retry_node(
        self: &Arc<Self>,
        id: ExecutionId,
        node_id: &str,
        user_id: &str,
    ) -> Result<ControlOutcome, EngineError> {
        let (slot, mut guard) = self.lock(id).await?;
        let exec = &mut guard.exec;
        ensure_reopenable(exec)?;

        let status = node_status(exec, node_id)?;
        if status != NodeStatus::Failed {
            return Err(ConflictError::Node {
                node_id: node_id.to_string(),
                status,
            }
            .into());
        }
        let max_attempts = slot
            .graph
            .max_attempts(node_id, self.config.default_max_attempts);
        let attempts = exec.node(node_id).map(|n| n.attempts).unwrap_or_default();
        if attempts >= max_attempts {
            return Err(EngineError::RetryLimitExceeded {
                node_id: node_id.to_string(),
                max_attempts,
            });
        }
        if exec.status == ExecutionStatus::Failed {
            self.attach(&slot, exec).await?;
        }

        if let Some(node) = exec.node_mut(node_id) {
            node.status = NodeStatus::Retrying;
            node.finished_at = None;
        }
        scheduler::reconcile_upstream_skips(&slot.graph, exec);
        reopen(exec);

        self.log(
            id,
            Some(node_id),
            LogLevel::Info,
            format!("Retry {} of {} requested by {}", attempts + 1, max_attempts, user_id),
        )
        .await;
        self.dispatch(&slot, &mut guard).await?;
        self.commit(&slot, &mut guard).await?;
        Ok(ControlOutcome::of(&guard.exec, Some(node_id)))
    }

    async fn skip_node(
        self: &Arc<Self>,
        id: ExecutionId,
        node_id: &str,
        reason: &str,
        user_id: &str,
    ) -> Result<ControlOutcome, EngineError> {
        let (slot, mut guard) = self.lock(id).await?;
        let exec = &mut guard.exec;
        ensure_reopenable(exec)?;

        let status = node_status(exec, node_id)?;
        match status {
            NodeStatus::Skipped => return Ok(ControlOutcome::of(exec, Some(node_id))),
            NodeStatus::Pending
            | NodeStatus::Ready
            | NodeStatus::Retrying
            | NodeStatus::WaitingForInput
            | NodeStatus::Failed => {}
            NodeStatus::Running
            | NodeStatus::Completed
            | NodeStatus::SkippedUpstream
            | NodeStatus::Cancelled => {
                return Err(ConflictError::Node {
                    node_id: node_id.to_string(),
                    status,
                }
                .into())
            }
        }
        if exec.is_terminal() && status != NodeStatus::Failed {
            return Err(ConflictError::Execution {
                execution_id: id,
                status: exec.status,
            }
            .into());
        }

        if exec.status == ExecutionStatus::Failed {
            self.attach(&slot, exec).await?;
        }

        if status == NodeStatus::WaitingForInput {
            if let Some(interaction_id) = exec.node(node_id).and_then(|n| n.interaction_id) {
                self.interactions
                    .close(interaction_id, "node skipped by operator")
                    .await?;
            }
        }
        scheduler::skip(&slot.graph, exec, node_id, reason, NodeStatus::Skipped);
        if status == NodeStatus::Failed {
            scheduler::reconcile_upstream_skips(&slot.graph, exec);
            reopen(exec);
        }

        self.node_skipped(id, node_id, &format!("{} (by {})", reason, user_id))
            .await;
        self.dispatch(&slot, &mut guard).await?;
        self.commit(&slot, &mut guard).await?;
        Ok(ControlOutcome::of(&guard.exec, Some(node_id)))
    }

    async fn submit_interaction(
        self: &Arc<Self>,
        interaction_id: InteractionId,
        data: HashMap<String, Value>,
        user_id: &str,
    ) -> Result<ControlOutcome, EngineError> {
        // The owning execution must be reachable before the session may
        // leave Pending.
        let pending = self.interactions.get(interaction_id).await?;
        let (slot, mut guard) = self.lock(pending.execution_id).await?;
        let node_id = pending.node_id.clone();
        if pending.is_pending() && !owns_node(&guard.exec, &pending) {
            let status = node_status(&guard.exec, &node_id)?;
            tracing::warn!(
                %interaction_id,
                node_id = %node_id,
                ?status,
                "Submission arrived after the node stopped waiting"
            );
            return Err(ConflictError::Node { node_id, status }.into());
        }

        let session = self
            .interactions
            .submit(interaction_id, data, user_id)
            .await?;
        self.accept_submission(&mut guard.exec, session).await?;
        self.dispatch(&slot, &mut guard).await?;
        self.commit(&slot, &mut guard).await?;
        Ok(ControlOutcome::of(&guard.exec, Some(&node_id)))
    }

    /// Complete the waiting node with a submitted session's data.
    async fn accept_submission(
        &self,
        exec: &mut WorkflowExecution,
        session: UiInteractionSession,
    ) -> Result<(), EngineError> {
        let node_id = session.node_id.clone();
        let interaction_id = session.id;
        let responder = session.responded_by.clone().unwrap_or_default();
        let output = session.output.clone().unwrap_or_default();
        if session.status == InteractionStatus::Submitted {
            self.interactions.complete(session).await?;
        }

        let duration_ms = if let Some(node) = exec.node_mut(&node_id) {
            node.output = Some(WorkflowDataContract::from_interaction(&node_id, output));
            node.error = None;
            node.finish(NodeStatus::Completed);
            node.duration_ms.unwrap_or_default()
        } else {
            0
        };

        self.events.emit(ExecutionEvent::NodeCompleted {
            execution_id: exec.id,
            node_id: node_id.clone(),
            duration_ms,
            timestamp: Utc::now(),
        });
        self.log(
            exec.id,
            Some(&node_id),
            LogLevel::Info,
            format!("Interaction {} answered by {}", interaction_id, responder),
        )
        .await;
        Ok(())
    }

    async fn cancel_interaction(
        self: &Arc<Self>,
        interaction_id: InteractionId,
        user_id: &str,
        reason: &str,
    ) -> Result<ControlOutcome, EngineError> {
        let pending = self.interactions.get(interaction_id).await?;
        let (slot, mut guard) = self.lock(pending.execution_id).await?;
        let session = self
            .interactions
            .cancel(interaction_id, user_id, reason)
            .await?;
        self.settle_unanswered(
            &slot,
            &mut guard,
            &session,
            Unanswered::Cancelled {
                user_id: user_id.to_string(),
                reason: reason.to_string(),
            },
        )
        .await?;
        Ok(ControlOutcome::of(&guard.exec, Some(&session.node_id)))
    }

    async fn process_timed_out_interactions(self: &Arc<Self>) -> Result<usize, EngineError> {
        let mut resolved = 0;
        for session in self.interactions.overdue().await? {
            let interaction_id = session.id;
            let (slot, mut guard) = match self.lock(session.execution_id).await {
                Ok(locked) => locked,
                Err(e) => {
                    tracing::warn!(
                        %interaction_id,
                        execution_id = %session.execution_id,
                        "Leaving overdue interaction pending: {}",
                        e
                    );
                    continue;
                }
            };
            let session = match self.interactions.time_out(session).await {
                Ok(session) => session,
                Err(EngineError::InteractionUnavailable { .. }) => continue,
                Err(e) => return Err(e),
            };
            resolved += 1;
            if let Err(e) = self
                .settle_unanswered(&slot, &mut guard, &session, Unanswered::TimedOut)
                .await
            {
                tracing::warn!(%interaction_id, "Failed to resume timed out interaction: {}", e);
            }
        }
        Ok(resolved)
    }

    /// Apply the fallback of a node whose interaction ended without data,
    /// then move the run on.
    async fn settle_unanswered(
        self: &Arc<Self>,
        slot: &Arc<ExecutionSlot>,
        guard: &mut Guard,
        session: &UiInteractionSession,
        cause: Unanswered,
    ) -> Result<(), EngineError> {
        if !owns_node(&guard.exec, session) {
            tracing::debug!(interaction_id = %session.id, "Interaction no longer owns its node");
            return Ok(());
        }
        self.apply_fallback(slot, &mut guard.exec, session, cause)
            .await?;
        self.dispatch(slot, guard).await?;
        self.commit(slot, guard).await
    }

    async fn apply_fallback(
        &self,
        slot: &ExecutionSlot,
        exec: &mut WorkflowExecution,
        session: &UiInteractionSession,
        cause: Unanswered,
    ) -> Result<(), EngineError> {
        let node_id = session.node_id.as_str();
        let spec = slot
            .graph
            .spec(node_id)
            .ok_or_else(|| EngineError::internal(format!("node {} missing from graph", node_id)))?
            .interaction_spec()?;
        let (fallback, error, reason) = match cause {
            Unanswered::Cancelled { user_id, reason } => (
                spec.on_cancel,
                NodeError::InteractionCancelled {
                    user_id,
                    reason: reason.clone(),
                },
                format!("interaction cancelled: {}", reason),
            ),
            Unanswered::TimedOut => (
                spec.on_timeout,
                NodeError::InteractionTimedOut,
                "interaction timed out".to_string(),
            ),
        };

        match fallback {
            InteractionFallback::Fail => {
                self.fail_node(slot, exec, node_id, error).await?;
            }
            InteractionFallback::Skip => {
                scheduler::skip(&slot.graph, exec, node_id, &reason, NodeStatus::Skipped);
                self.node_skipped(session.execution_id, node_id, &reason).await;
            }
        }
        Ok(())
    }

    async fn recover(self: &Arc<Self>) -> Result<usize, EngineError> {
        let active = self.store.list_active().await?;
        let mut recovered = 0;

        for stale in active {
            let id = stale.id;
            let (slot, mut guard) = match self.lock(id).await {
                Ok(locked) => locked,
                Err(e) => {
                    tracing::error!(execution_id = %id, "Cannot recover execution: {}", e);
                    continue;
                }
            };
            if guard.owned {
                continue;
            }

            let orphaned: Vec<NodeId> = guard
                .exec
                .nodes
                .values()
                .filter(|n| n.status == NodeStatus::Running)
                .map(|n| n.node_id.clone())
                .collect();

            for node_id in &orphaned {
                let max_attempts = slot
                    .graph
                    .max_attempts(node_id, self.config.default_max_attempts);
                let attempts = guard.exec.node(node_id).map(|n| n.attempts).unwrap_or_default();
                let requeue =
                    self.config.recovery_policy == RecoveryPolicy::Requeue && attempts < max_attempts;

                if requeue {
                    if let Some(node) = guard.exec.node_mut(node_id) {
                        node.status = NodeStatus::Retrying;
                    }
                    self.log(id, Some(node_id.as_str()), LogLevel::Warn, "Requeued after restart")
                        .await;
                } else {
                    self.fail_node(&slot, &mut guard.exec, node_id, NodeError::Orphaned)
                        .await?;
                }
            }

            let settled = self.reconcile_interactions(&slot, &mut guard.exec).await?;

            tracing::info!(
                execution_id = %id,
                orphaned = orphaned.len(),
                settled,
                "Recovered execution"
            );
            self.dispatch(&slot, &mut guard).await?;
            self.commit(&slot, &mut guard).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Finish waiting nodes whose session was resolved but never applied,
    /// as when a process stops between the two writes. Returns how many.
    async fn reconcile_interactions(
        &self,
        slot: &ExecutionSlot,
        exec: &mut WorkflowExecution,
    ) -> Result<usize, EngineError> {
        let waiting: Vec<InteractionId> = exec
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::WaitingForInput)
            .filter_map(|n| n.interaction_id)
            .collect();

        let mut settled = 0;
        for interaction_id in waiting {
            let session = match self.interactions.get(interaction_id).await {
                Ok(session) => session,
                Err(EngineError::InteractionNotFound(_)) => {
                    tracing::warn!(%interaction_id, "Waiting node refers to a missing interaction");
                    continue;
                }
                Err(e) => return Err(e),
            };
            // An earlier fallback may have halted this node already.
            if !owns_node(exec, &session) {
                continue;
            }
            match session.status {
                InteractionStatus::Pending => continue,
                InteractionStatus::Submitted | InteractionStatus::Completed => {
                    self.accept_submission(exec, session).await?;
                }
                InteractionStatus::Cancelled => {
                    let cause = Unanswered::Cancelled {
                        user_id: session
                            .responded_by
                            .clone()
                            .unwrap_or_else(|| "system".to_string()),
                        reason: session.cancel_reason.clone().unwrap_or_default(),
                    };
                    self.apply_fallback(slot, exec, &session, cause).await?;
                }
                InteractionStatus::TimedOut => {
                    self.apply_fallback(slot, exec, &session, Unanswered::TimedOut)
                        .await?;
                }
            }
            settled += 1;
        }
        Ok(settled)
    }

    /// Promote Ready nodes and launch what the pause flag and the
    /// concurrency limit allow.
    async fn dispatch(self: &Arc<Self>, slot: &Arc<ExecutionSlot>, guard: &mut Guard) -> Result<(), EngineError> {
        guard.owned = true;
        let exec = &mut guard.exec;
        if exec.is_terminal() {
            return Ok(());
        }

        let promotion = scheduler::promote_ready(&slot.graph, exec);
        for node_id in &promotion.branch_skipped {
            self.node_skipped(exec.id, node_id, scheduler::BRANCH_NOT_TAKEN)
                .await;
        }
        if exec.status == ExecutionStatus::Paused {
            return Ok(());
        }

        let limit = slot
            .graph
            .workflow()
            .settings
            .max_parallel_nodes
            .unwrap_or(self.config.max_parallel_nodes)
            .max(1);
        for node_id in scheduler::dispatchable(&slot.graph, exec, limit) {
            self.launch(slot, exec, &node_id).await?;
        }
        Ok(())
    }

    /// Start one attempt of a Ready, Retrying or manually dispatched node.
    async fn launch(
        self: &Arc<Self>,
        slot: &Arc<ExecutionSlot>,
        exec: &mut WorkflowExecution,
        node_id: &str,
    ) -> Result<(), EngineError> {
        let spec = slot
            .graph
            .spec(node_id)
            .ok_or_else(|| EngineError::internal(format!("node {} missing from graph", node_id)))?;

        let reuse = exec
            .node(node_id)
            .filter(|n| n.status == NodeStatus::Retrying)
            .and_then(|n| n.input.clone());
        let inputs = match reuse {
            Some(inputs) => inputs,
            None => self.executor.resolve_input(&slot.graph, exec, node_id),
        };

        let Some(node) = exec.node_mut(node_id) else {
            return Err(EngineError::NodeNotFound {
                execution_id: exec.id,
                node_id: node_id.to_string(),
            });
        };
        node.attempts += 1;
        node.input = Some(inputs.clone());
        node.error = None;
        node.skip_reason = None;
        node.started_at = Some(Utc::now());
        node.finished_at = None;
        node.duration_ms = None;
        let attempt = node.attempts;

        if spec.is_interaction() {
            let session = self.interactions.open(exec, spec, attempt, &inputs).await?;
            if let Some(node) = exec.node_mut(node_id) {
                node.status = NodeStatus::WaitingForInput;
                node.interaction_id = Some(session.id);
            }
            self.events.emit(ExecutionEvent::NodeWaitingForInput {
                execution_id: exec.id,
                node_id: node_id.to_string(),
                interaction_id: session.id,
                assignee: session.assignee.clone(),
                timestamp: Utc::now(),
            });
            self.log(
                exec.id,
                Some(node_id),
                LogLevel::Info,
                format!("Waiting for input from {} (interaction {})", session.assignee, session.id),
            )
            .await;
            return Ok(());
        }

        if let Some(node) = exec.node_mut(node_id) {
            node.status = NodeStatus::Running;
            node.interaction_id = None;
        }
        let job = NodeJob {
            execution_id: exec.id,
            node_id: node_id.to_string(),
            node_type: spec.node_type.clone(),
            attempt,
            inputs,
            config: spec.config.clone(),
            timeout: slot
                .graph
                .workflow()
                .settings
                .node_timeout_ms
                .map(Duration::from_millis)
                .or(self.config.default_node_timeout),
            cancellation: slot.cancellation.clone(),
        };

        self.events.emit(ExecutionEvent::NodeStarted {
            execution_id: exec.id,
            node_id: node_id.to_string(),
            node_type: spec.node_type.clone(),
            attempt,
            timestamp: Utc::now(),
        });
        self.log(
            exec.id,
            Some(node_id),
            LogLevel::Debug,
            format!("Attempt {} started", attempt),
        )
        .await;

        tokio::spawn(self.clone().run_node_task(job));
        Ok(())
    }

    /// Boxed so the dispatch -> spawn -> complete -> dispatch cycle has a
    /// nameable future type.
    fn run_node_task(self: Arc<Self>, job: NodeJob) -> BoxFuture<'static, ()> {
        async move {
            let execution_id = job.execution_id;
            let result = self.executor.run(job).await;
            if let Err(e) = self.complete_attempt(execution_id, result).await {
                tracing::error!(%execution_id, "Failed to record node result: {}", e);
            }
        }
        .boxed()
    }

    async fn complete_attempt(
        self: &Arc<Self>,
        id: ExecutionId,
        result: AttemptResult,
    ) -> Result<(), EngineError> {
        let (slot, mut guard) = self.lock(id).await?;
        let node_id = result.node_id.as_str();
        let current = guard
            .exec
            .node(node_id)
            .map(|n| (n.status, n.attempts));
        if current != Some((NodeStatus::Running, result.attempt)) {
            tracing::debug!(
                execution_id = %id,
                node_id,
                attempt = result.attempt,
                ?current,
                "Ignoring stale node result"
            );
            return Ok(());
        }

        match result.outcome {
            Ok(output) => {
                if let Some(node) = guard.exec.node_mut(node_id) {
                    node.output = Some(WorkflowDataContract::computed(node_id, output.outputs));
                    node.finish(NodeStatus::Completed);
                    node.duration_ms = Some(result.duration_ms);
                }
                self.events.emit(ExecutionEvent::NodeCompleted {
                    execution_id: id,
                    node_id: node_id.to_string(),
                    duration_ms: result.duration_ms,
                    timestamp: Utc::now(),
                });
                self.log(
                    id,
                    Some(node_id),
                    LogLevel::Info,
                    format!("Completed in {}ms", result.duration_ms),
                )
                .await;
            }
            Err(error) => {
                self.fail_node(&slot, &mut guard.exec, node_id, error).await?;
            }
        }

        self.dispatch(&slot, &mut guard).await?;
        self.commit(&slot, &mut guard).await
    }

    /// Record a node failure and apply its failure policy to the rest of
    /// the run.
    async fn fail_node(
        &self,
        slot: &ExecutionSlot,
        exec: &mut WorkflowExecution,
        node_id: &str,
        error: NodeError,
    ) -> Result<(), EngineError> {
        let message = error.to_string();
        let attempt = if let Some(node) = exec.node_mut(node_id) {
            node.error = Some(NodeErrorInfo::new(error, node.attempts));
            node.finish(NodeStatus::Failed);
            node.attempts
        } else {
            0
        };

        self.events.emit(ExecutionEvent::NodeFailed {
            execution_id: exec.id,
            node_id: node_id.to_string(),
            error: message.clone(),
            attempt,
            timestamp: Utc::now(),
        });
        self.log(
            exec.id,
            Some(node_id),
            LogLevel::Error,
            format!("Attempt {} failed: {}", attempt, message),
        )
        .await;

        let descendants = slot.graph.descendants(node_id);
        let halted = scheduler::halted_waiting(&slot.graph, exec, node_id);
        for waiting in &halted {
            let reason = scheduler::failure_skip_reason(node_id, descendants.contains(waiting));
            if let Some(interaction_id) = exec.node(waiting).and_then(|n| n.interaction_id) {
                self.interactions.close(interaction_id, &reason).await?;
            }
            scheduler::skip(&slot.graph, exec, waiting, &reason, NodeStatus::SkippedUpstream);
        }
        let skipped = scheduler::apply_failure(&slot.graph, exec, node_id);
        for skipped_id in halted.iter().chain(skipped.iter()) {
            let reason = exec
                .node(skipped_id)
                .and_then(|n| n.skip_reason.clone())
                .unwrap_or_default();
            self.node_skipped(exec.id, skipped_id, &reason).await;
        }
        Ok(())
    }

    /// Settle the overall status, persist, then publish.
    async fn commit(&self, slot: &ExecutionSlot, guard: &mut Guard) -> Result<(), EngineError> {
        let exec = &mut guard.exec;
        scheduler::refresh_status(&slot.graph, exec);
        exec.touch();
        self.store.save_execution(exec).await?;

        let status = exec.status;
        let previous = slot.status_tx.send_replace(status);
        if previous != status {
            tracing::info!(execution_id = %exec.id, ?previous, ?status, "Execution status changed");
            self.events.emit(ExecutionEvent::ExecutionStatusChanged {
                execution_id: exec.id,
                status,
                timestamp: Utc::now(),
            });
            let level = match status {
                ExecutionStatus::Failed => LogLevel::Error,
                ExecutionStatus::Cancelled => LogLevel::Warn,
                _ => LogLevel::Info,
            };
            self.log(exec.id, None, level, format!("Status {:?} -> {:?}", previous, status))
                .await;
        }

        if status.is_terminal() {
            let id = exec.id;
            guard.retired = true;
            let mut slots = self.slots.write().await;
            if slots
                .get(&id)
                .is_some_and(|registered| Arc::ptr_eq(&registered.state, &slot.state))
            {
                slots.remove(&id);
            }
        }
        Ok(())
    }

    async fn node_skipped(&self, id: ExecutionId, node_id: &str, reason: &str) {
        self.events.emit(ExecutionEvent::NodeSkipped {
            execution_id: id,
            node_id: node_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        self.log(id, Some(node_id), LogLevel::Info, format!("Skipped: {}", reason))
            .await;
    }

    /// Append to the execution log. A failed append is reported but does
    /// not fail the operation that produced it.
    async fn log(&self, id: ExecutionId, node_id: Option<&str>, level: LogLevel, message: impl Into<String>) {
        let entry = ExecutionLogEntry::new(id, node_id.map(str::to_string), level, message);
        if let Err(e) = self.store.append_log(entry).await {
            tracing::warn!(execution_id = %id, "Failed to append execution log: {}", e);
        }
    }
}

/// Whether the session's node is still suspended on it.
fn owns_node(exec: &WorkflowExecution, session: &UiInteractionSession) -> bool {
    exec.node(&session.node_id).is_some_and(|n| {
        n.status == NodeStatus::WaitingForInput && n.interaction_id == Some(session.id)
    })
}

fn node_status(exec: &WorkflowExecution, node_id: &str) -> Result<NodeStatus, EngineError> {
    exec.node_status(node_id)
        .ok_or_else(|| EngineError::NodeNotFound {
            execution_id: exec.id,
            node_id: node_id.to_string(),
        })
}

/// Pause, resume and manual dispatch need a live execution.
fn ensure_open(exec: &WorkflowExecution) -> Result<(), EngineError> {
    if exec.is_terminal() {
        return Err(ConflictError::Execution {
            execution_id: exec.id,
            status: exec.status,
        }
        .into());
    }
    Ok(())
}

/// Retry and skip may reopen a Failed execution, never a Completed or
/// Cancelled one.
fn ensure_reopenable(exec: &WorkflowExecution) -> Result<(), EngineError> {
    match exec.status {
        ExecutionStatus::Completed | ExecutionStatus::Cancelled => Err(ConflictError::Execution {
            execution_id: exec.id,
            status: exec.status,
        }
        .into()),
        _ => Ok(()),
    }
}

fn reopen(exec: &mut WorkflowExecution) {
    if exec.status == ExecutionStatus::Failed {
        exec.status = ExecutionStatus::Running;
        exec.finished_at = None;
    }
}
