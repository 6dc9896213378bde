use super::{ExecutionStore, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loomcore::{
    ExecutionId, ExecutionLogEntry, InteractionId, InteractionStatus, StoreError,
    UiInteractionSession, WorkflowExecution,
};
use serde::de::DeserializeOwned;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Transactional, Tree};
use std::path::Path;
use uuid::Uuid;

type TxResult<T> = Result<T, ConflictableTransactionError<StoreError>>;

/// Embedded on-disk store.
///
/// Trees:
/// - `executions`: execution id -> execution JSON
/// - `executions_active`: execution id -> () for non-terminal executions
/// - `execution_logs`: execution id ++ sequence (big endian) -> entry JSON
/// - `interactions`: interaction id -> session JSON
/// - `interactions_by_execution`: execution id ++ interaction id -> ()
/// - `interactions_pending`: assignee ++ 0x00 ++ interaction id -> ()
pub struct SledStore {
    db: sled::Db,
    executions: Tree,
    active: Tree,
    logs: Tree,
    interactions: Tree,
    by_execution: Tree,
    pending: Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(backend)?;
        tracing::info!(path = %path.display(), "Opened sled store");
        Self::with_db(db)
    }

    /// Store backed by a temporary database removed on drop
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(backend)?;
        Self::with_db(db)
    }

    /// Store over an already opened database; handles to the same `Db` share state
    pub fn with_db(db: sled::Db) -> StoreResult<Self> {
        let tree = |name: &str| db.open_tree(name).map_err(backend);
        Ok(Self {
            executions: tree("executions")?,
            active: tree("executions_active")?,
            logs: tree("execution_logs")?,
            interactions: tree("interactions")?,
            by_execution: tree("interactions_by_execution")?,
            pending: tree("interactions_pending")?,
            db,
        })
    }

    async fn flush(&self) -> StoreResult<()> {
        self.db.flush_async().await.map_err(backend)?;
        Ok(())
    }

    fn load_session(&self, id: &[u8]) -> StoreResult<Option<UiInteractionSession>> {
        self.interactions
            .get(id)
            .map_err(backend)?
            .map(|raw| decode(&raw))
            .transpose()
    }

    /// Sessions named by the last 16 bytes of each key under `prefix`
    fn sessions_under(&self, index: &Tree, prefix: &[u8]) -> StoreResult<Vec<UiInteractionSession>> {
        let mut sessions = Vec::new();
        for item in index.scan_prefix(prefix) {
            let (key, _) = item.map_err(backend)?;
            let id = &key[key.len().saturating_sub(16)..];
            if let Some(session) = self.load_session(id)? {
                sessions.push(session);
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    /// Write a session and keep both interaction indexes in step with it
    fn write_session(
        interactions: &sled::transaction::TransactionalTree,
        by_execution: &sled::transaction::TransactionalTree,
        pending: &sled::transaction::TransactionalTree,
        session: &UiInteractionSession,
        encoded: &[u8],
    ) -> TxResult<()> {
        interactions.insert(session.id.as_bytes().to_vec(), encoded)?;
        by_execution.insert(
            concat(session.execution_id.as_bytes(), session.id.as_bytes()),
            Vec::<u8>::new(),
        )?;
        let pending_key = pending_key(&session.assignee, session.id);
        if session.is_pending() {
            pending.insert(pending_key, Vec::<u8>::new())?;
        } else {
            pending.remove(pending_key)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for SledStore {
    async fn insert_execution(&self, exec: &WorkflowExecution) -> StoreResult<()> {
        let key = exec.id.as_bytes().to_vec();
        let value = serde_json::to_vec(exec)?;
        let active = !exec.is_terminal();

        (&self.executions, &self.active)
            .transaction(|(executions, index)| -> TxResult<()> {
                if executions.get(&key)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(StoreError::AlreadyExists(
                        exec.id.to_string(),
                    )));
                }
                executions.insert(key.clone(), value.clone())?;
                if active {
                    index.insert(key.clone(), Vec::<u8>::new())?;
                }
                Ok(())
            })
            .map_err(tx_error)?;
        self.flush().await
    }

    async fn save_execution(&self, exec: &WorkflowExecution) -> StoreResult<()> {
        let key = exec.id.as_bytes().to_vec();
        let value = serde_json::to_vec(exec)?;
        let active = !exec.is_terminal();

        (&self.executions, &self.active)
            .transaction(|(executions, index)| -> TxResult<()> {
                executions.insert(key.clone(), value.clone())?;
                if active {
                    index.insert(key.clone(), Vec::<u8>::new())?;
                } else {
                    index.remove(key.clone())?;
                }
                Ok(())
            })
            .map_err(tx_error)?;
        self.flush().await
    }

    async fn load_execution(&self, id: ExecutionId) -> StoreResult<Option<WorkflowExecution>> {
        self.executions
            .get(id.as_bytes())
            .map_err(backend)?
            .map(|raw| decode(&raw))
            .transpose()
    }

    async fn list_active(&self) -> StoreResult<Vec<WorkflowExecution>> {
        let mut active = Vec::new();
        for item in self.active.iter() {
            let (key, _) = item.map_err(backend)?;
            if let Some(raw) = self.executions.get(&key).map_err(backend)? {
                active.push(decode::<WorkflowExecution>(&raw)?);
            }
        }
        active.sort_by_key(|e| e.created_at);
        Ok(active)
    }

    async fn append_log(&self, mut entry: ExecutionLogEntry) -> StoreResult<u64> {
        // generate_id is monotonic across restarts
        let sequence = self.db.generate_id().map_err(backend)?;
        entry.sequence = sequence;
        let key = concat(entry.execution_id.as_bytes(), &sequence.to_be_bytes());
        self.logs
            .insert(key, serde_json::to_vec(&entry)?)
            .map_err(backend)?;
        Ok(sequence)
    }

    async fn logs(
        &self,
        id: ExecutionId,
        skip: usize,
        take: usize,
    ) -> StoreResult<Vec<ExecutionLogEntry>> {
        self.logs
            .scan_prefix(id.as_bytes())
            .skip(skip)
            .take(take)
            .map(|item| {
                let (_, raw) = item.map_err(backend)?;
                decode(&raw)
            })
            .collect()
    }

    async fn insert_interaction(&self, session: &UiInteractionSession) -> StoreResult<()> {
        let encoded = serde_json::to_vec(session)?;

        (&self.interactions, &self.by_execution, &self.pending)
            .transaction(|(interactions, by_execution, pending)| -> TxResult<()> {
                if interactions.get(session.id.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(StoreError::AlreadyExists(
                        session.id.to_string(),
                    )));
                }
                Self::write_session(interactions, by_execution, pending, session, &encoded)
            })
            .map_err(tx_error)?;
        self.flush().await
    }

    async fn load_interaction(
        &self,
        id: InteractionId,
    ) -> StoreResult<Option<UiInteractionSession>> {
        self.load_session(id.as_bytes())
    }

    async fn transition_interaction(
        &self,
        expected: InteractionStatus,
        next: &UiInteractionSession,
    ) -> StoreResult<()> {
        let encoded = serde_json::to_vec(next)?;

        (&self.interactions, &self.by_execution, &self.pending)
            .transaction(|(interactions, by_execution, pending)| -> TxResult<()> {
                let raw = interactions.get(next.id.as_bytes())?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(StoreError::NotFound(next.id.to_string()))
                })?;
                let current: UiInteractionSession =
                    decode(&raw).map_err(ConflictableTransactionError::Abort)?;
                if current.status != expected {
                    return Err(ConflictableTransactionError::Abort(
                        StoreError::InteractionConflict {
                            id: next.id,
                            expected,
                            actual: current.status,
                        },
                    ));
                }
                Self::write_session(interactions, by_execution, pending, next, &encoded)
            })
            .map_err(tx_error)?;
        self.flush().await
    }

    async fn interactions_for_execution(
        &self,
        id: ExecutionId,
    ) -> StoreResult<Vec<UiInteractionSession>> {
        self.sessions_under(&self.by_execution, id.as_bytes())
    }

    async fn pending_interactions_for_user(
        &self,
        user_id: &str,
    ) -> StoreResult<Vec<UiInteractionSession>> {
        let mut prefix = user_id.as_bytes().to_vec();
        prefix.push(0);
        self.sessions_under(&self.pending, &prefix)
    }

    async fn overdue_interactions(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<UiInteractionSession>> {
        let mut overdue: Vec<UiInteractionSession> = self
            .sessions_under(&self.pending, &[])?
            .into_iter()
            .filter(|s| s.is_overdue(now))
            .collect();
        overdue.sort_by_key(|s| s.timeout_at);
        Ok(overdue)
    }
}

fn backend(err: sled::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn tx_error(err: TransactionError<StoreError>) -> StoreError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => backend(e),
    }
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> StoreResult<T> {
    Ok(serde_json::from_slice(raw)?)
}

fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(a.len() + b.len());
    key.extend_from_slice(a);
    key.extend_from_slice(b);
    key
}

fn pending_key(assignee: &str, id: Uuid) -> Vec<u8> {
    let mut key = assignee.as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(id.as_bytes());
    key
}
