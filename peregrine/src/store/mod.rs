//! Persistence adapter — durable storage of tasks, approvals, evidence,
//! and the replayable per-task event log.
//!
//! The engine consumes the [`TaskStore`] capability; [`MemoryStore`] is the
//! bundled reference implementation. Real deployments put a database behind
//! the same trait.
//!
//! # Contract
//!
//! - Task upserts are atomic per task; concurrent updates for the same id
//!   are serialized by the adapter.
//! - [`TaskStore::resolve_approval`] is conflict-safe: the first resolution
//!   wins, later ones fail with [`StoreError::AlreadyResolved`].
//! - The event log is bounded ([`TASK_EVENT_HISTORY_MAX`] entries,
//!   [`TASK_EVENT_TTL`] age); slow subscribers only see the surviving tail
//!   on reconnect.
//! - Implementations retry transient backend faults internally with bounded
//!   backoff; any error that reaches the caller is permanent and fails the
//!   owning task.

mod memory;

pub use memory::MemoryStore;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::approval::{ApprovalRequest, ApprovalStatus};
use crate::error::StoreError;
use crate::event::TaskEvent;
use crate::evidence::DecisionRecord;
use crate::task::{Task, TaskStatus, TaskSummary};

/// Maximum entries retained in a per-task event log.
pub const TASK_EVENT_HISTORY_MAX: usize = 300;

/// Maximum age of a retained event log entry.
pub const TASK_EVENT_TTL: Duration = Duration::from_secs(3600);

/// A stream of task events (replay followed by live tail).
pub type EventStream = Pin<Box<dyn Stream<Item = TaskEvent> + Send>>;

/// Filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Owning user (required).
    pub user_id: String,
    /// Restrict to one workspace.
    pub workspace_id: Option<String>,
    /// Restrict to one status.
    pub status: Option<TaskStatus>,
}

/// Durable storage consumed by the executor and service layer.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task.
    async fn save_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Upsert an existing task. Atomic per task id.
    async fn update_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Load a task by id.
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// List task summaries matching the filter, newest first.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskSummary>, StoreError>;

    /// Persist an approval request.
    async fn save_approval(&self, approval: &ApprovalRequest) -> Result<(), StoreError>;

    /// Load an approval request by id.
    async fn get_approval(&self, id: &str) -> Result<Option<ApprovalRequest>, StoreError>;

    /// Resolve a pending approval. The first resolution wins.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for unknown ids,
    /// [`StoreError::AlreadyResolved`] when a decision already exists.
    async fn resolve_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
        decided_by: &str,
    ) -> Result<ApprovalRequest, StoreError>;

    /// Append an event to the per-task log and publish it to subscribers.
    async fn append_event(&self, event: &TaskEvent) -> Result<(), StoreError>;

    /// Replay the retained event log, then follow live events until a
    /// terminal event arrives or the subscriber is dropped.
    fn replay_events(&self, task_id: &str) -> EventStream;

    /// Persist a task's evidence chain in one batch.
    async fn save_evidence(
        &self,
        task_id: &str,
        records: &[DecisionRecord],
    ) -> Result<(), StoreError>;

    /// Load a task's persisted evidence chain.
    async fn get_evidence(&self, task_id: &str) -> Result<Vec<DecisionRecord>, StoreError>;
}
