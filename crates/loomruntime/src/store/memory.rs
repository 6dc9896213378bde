use super::{ExecutionStore, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loomcore::{
    ExecutionId, ExecutionLogEntry, InteractionId, InteractionStatus, StoreError,
    UiInteractionSession, UserId, WorkflowExecution,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    executions: HashMap<ExecutionId, WorkflowExecution>,
    active: HashSet<ExecutionId>,
    logs: BTreeMap<(ExecutionId, u64), ExecutionLogEntry>,
    next_sequence: u64,
    interactions: HashMap<InteractionId, UiInteractionSession>,
    pending_by_user: HashMap<UserId, HashSet<InteractionId>>,
}

impl State {
    fn index_execution(&mut self, exec: &WorkflowExecution) {
        if exec.is_terminal() {
            self.active.remove(&exec.id);
        } else {
            self.active.insert(exec.id);
        }
    }

    fn index_interaction(&mut self, session: &UiInteractionSession) {
        let ids = self.pending_by_user.entry(session.assignee.clone()).or_default();
        if session.is_pending() {
            ids.insert(session.id);
        } else {
            ids.remove(&session.id);
            if ids.is_empty() {
                self.pending_by_user.remove(&session.assignee);
            }
        }
    }
}

/// Process-local store. Everything is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn insert_execution(&self, exec: &WorkflowExecution) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.executions.contains_key(&exec.id) {
            return Err(StoreError::AlreadyExists(exec.id.to_string()));
        }
        state.index_execution(exec);
        state.executions.insert(exec.id, exec.clone());
        Ok(())
    }

    async fn save_execution(&self, exec: &WorkflowExecution) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.index_execution(exec);
        state.executions.insert(exec.id, exec.clone());
        Ok(())
    }

    async fn load_execution(&self, id: ExecutionId) -> StoreResult<Option<WorkflowExecution>> {
        Ok(self.state.read().await.executions.get(&id).cloned())
    }

    async fn list_active(&self) -> StoreResult<Vec<WorkflowExecution>> {
        let state = self.state.read().await;
        let mut active: Vec<WorkflowExecution> = state
            .active
            .iter()
            .filter_map(|id| state.executions.get(id).cloned())
            .collect();
        active.sort_by_key(|e| e.created_at);
        Ok(active)
    }

    async fn append_log(&self, mut entry: ExecutionLogEntry) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        entry.sequence = sequence;
        state.logs.insert((entry.execution_id, sequence), entry);
        Ok(sequence)
    }

    async fn logs(
        &self,
        id: ExecutionId,
        skip: usize,
        take: usize,
    ) -> StoreResult<Vec<ExecutionLogEntry>> {
        let state = self.state.read().await;
        Ok(state
            .logs
            .range((id, 0)..=(id, u64::MAX))
            .skip(skip)
            .take(take)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn insert_interaction(&self, session: &UiInteractionSession) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.interactions.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists(session.id.to_string()));
        }
        state.index_interaction(session);
        state.interactions.insert(session.id, session.clone());
        Ok(())
    }

    async fn load_interaction(
        &self,
        id: InteractionId,
    ) -> StoreResult<Option<UiInteractionSession>> {
        Ok(self.state.read().await.interactions.get(&id).cloned())
    }

    async fn transition_interaction(
        &self,
        expected: InteractionStatus,
        next: &UiInteractionSession,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let current = state
            .interactions
            .get(&next.id)
            .ok_or_else(|| StoreError::NotFound(next.id.to_string()))?;
        if current.status != expected {
            return Err(StoreError::InteractionConflict {
                id: next.id,
                expected,
                actual: current.status,
            });
        }
        state.index_interaction(next);
        state.interactions.insert(next.id, next.clone());
        Ok(())
    }

    async fn interactions_for_execution(
        &self,
        id: ExecutionId,
    ) -> StoreResult<Vec<UiInteractionSession>> {
        let state = self.state.read().await;
        let mut sessions: Vec<UiInteractionSession> = state
            .interactions
            .values()
            .filter(|s| s.execution_id == id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn pending_interactions_for_user(
        &self,
        user_id: &str,
    ) -> StoreResult<Vec<UiInteractionSession>> {
        let state = self.state.read().await;
        let Some(ids) = state.pending_by_user.get(user_id) else {
            return Ok(Vec::new());
        };
        let mut sessions: Vec<UiInteractionSession> = ids
            .iter()
            .filter_map(|id| state.interactions.get(id).cloned())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn overdue_interactions(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<UiInteractionSession>> {
        let state = self.state.read().await;
        let mut sessions: Vec<UiInteractionSession> = state
            .pending_by_user
            .values()
            .flatten()
            .filter_map(|id| state.interactions.get(id))
            .filter(|s| s.is_overdue(now))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.timeout_at);
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract_tests;

    #[tokio::test]
    async fn test_active_index() {
        contract_tests::active_index_follows_status(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_logs() {
        contract_tests::logs_are_ordered_and_paged(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_interactions() {
        contract_tests::interaction_cas_and_indexes(&MemoryStore::new()).await;
    }
}
