//! Durable state of executions, interactions and execution logs.
//!
//! Listings used by dashboards and sweeps (`list_active`,
//! `pending_interactions_for_user`, `overdue_interactions`) are served from
//! secondary indexes that each implementation updates in the same write as
//! the record they describe.

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loomcore::{
    ExecutionId, ExecutionLogEntry, InteractionId, InteractionStatus, StoreError,
    UiInteractionSession, WorkflowExecution,
};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Store a new execution; fails if the id is taken
    async fn insert_execution(&self, exec: &WorkflowExecution) -> StoreResult<()>;

    /// Overwrite an execution and update the active index
    async fn save_execution(&self, exec: &WorkflowExecution) -> StoreResult<()>;

    async fn load_execution(&self, id: ExecutionId) -> StoreResult<Option<WorkflowExecution>>;

    /// Executions whose status is not terminal
    async fn list_active(&self) -> StoreResult<Vec<WorkflowExecution>>;

    /// Append a log entry, assigning its sequence number
    async fn append_log(&self, entry: ExecutionLogEntry) -> StoreResult<u64>;

    /// Log entries of one execution in append order
    async fn logs(&self, id: ExecutionId, skip: usize, take: usize)
        -> StoreResult<Vec<ExecutionLogEntry>>;

    async fn insert_interaction(&self, session: &UiInteractionSession) -> StoreResult<()>;

    async fn load_interaction(&self, id: InteractionId) -> StoreResult<Option<UiInteractionSession>>;

    /// Replace a session only if its stored status is still `expected`.
    /// Fails with `StoreError::InteractionConflict` otherwise.
    async fn transition_interaction(
        &self,
        expected: InteractionStatus,
        next: &UiInteractionSession,
    ) -> StoreResult<()>;

    async fn interactions_for_execution(
        &self,
        id: ExecutionId,
    ) -> StoreResult<Vec<UiInteractionSession>>;

    async fn pending_interactions_for_user(&self, user_id: &str)
        -> StoreResult<Vec<UiInteractionSession>>;

    /// Pending sessions whose `timeout_at` is at or before `now`
    async fn overdue_interactions(&self, now: DateTime<Utc>)
        -> StoreResult<Vec<UiInteractionSession>>;
}
