//! Typed task events — the externally-visible progress stream.
//!
//! Every observable action of a running task is emitted as a [`TaskEvent`]:
//! persisted to the per-task event log and forwarded to any live
//! subscriber. Per task, events are totally ordered by emission; for a
//! parallel tool batch every tool still gets its `tool_called` before its
//! matching `tool_result`.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::store::TaskStore;
use std::sync::Arc;

/// Kind of a task event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// The planner produced a plan.
    PlanCreated,
    /// A step entered execution.
    StepStarted,
    /// A tool dispatch began.
    ToolCalled,
    /// A tool dispatch finished.
    ToolResult,
    /// A step reached `complete`.
    StepComplete,
    /// Execution is suspended on a human approval.
    ApprovalNeeded,
    /// Model text without a tool call (autonomous mode).
    Thinking,
    /// The task finished successfully.
    TaskComplete,
    /// The task failed.
    TaskFailed,
    /// The task was paused or cancelled.
    TaskPaused,
    /// The verifier began checking a completion claim.
    VerifierStarted,
    /// The verifier accepted the completion claim.
    VerifierPassed,
    /// The verifier rejected the completion claim.
    VerifierFailed,
    /// The router chose a provider/model for a step.
    RoutingInfo,
    /// Updated run metrics.
    MetricsUpdate,
}

impl TaskEventKind {
    /// Whether this event closes the task's event stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::TaskComplete | Self::TaskFailed | Self::TaskPaused)
    }
}

/// Snapshot of task progress attached to every event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Terminal steps so far.
    pub current_step: usize,
    /// Total steps in the plan.
    pub total_steps: usize,
    /// Iterations consumed.
    pub iterations: u32,
    /// Tokens consumed.
    pub tokens_used: u64,
    /// Tool dispatches performed.
    pub tool_calls: u32,
}

/// One externally-visible progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: TaskEventKind,
    /// Owning task.
    pub task_id: String,
    /// Owning step, when step-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Free-form payload (plan JSON, thinking text, error text, ...).
    #[serde(default)]
    pub content: String,
    /// Tool name for tool-scoped events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// JSON-encoded tool arguments for `tool_called`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<String>,
    /// Tool output or error for `tool_result`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
    /// Approval id for `approval_needed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    /// Progress snapshot at emission time.
    pub progress: Progress,
}

impl TaskEvent {
    /// Create an event with the given kind and progress.
    #[must_use]
    pub fn new(kind: TaskEventKind, task_id: impl Into<String>, progress: Progress) -> Self {
        Self {
            kind,
            task_id: task_id.into(),
            step_id: None,
            content: String::new(),
            tool_name: None,
            tool_args: None,
            tool_result: None,
            approval_id: None,
            progress,
        }
    }

    /// Sets the step id.
    #[must_use]
    pub fn step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Sets the content payload.
    #[must_use]
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Sets the tool name.
    #[must_use]
    pub fn tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    /// Sets the JSON-encoded tool arguments.
    #[must_use]
    pub fn args(mut self, tool_args: impl Into<String>) -> Self {
        self.tool_args = Some(tool_args.into());
        self
    }

    /// Sets the tool result payload.
    #[must_use]
    pub fn result(mut self, tool_result: impl Into<String>) -> Self {
        self.tool_result = Some(tool_result.into());
        self
    }

    /// Sets the approval id.
    #[must_use]
    pub fn approval(mut self, approval_id: impl Into<String>) -> Self {
        self.approval_id = Some(approval_id.into());
        self
    }
}

/// Multi-producer event outlet owned by the executor.
///
/// Every emission is appended to the persistent per-task log (which fans
/// out to reconnecting subscribers) and forwarded to the live stream of the
/// caller that started the task. Cloneable so parallel tool dispatches can
/// emit concurrently; ordering within one task comes from the single-writer
/// discipline plus the channel's FIFO guarantee.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<TaskEvent>,
    store: Arc<dyn TaskStore>,
}

impl EventSink {
    /// Create a sink that forwards to `tx` and persists via `store`.
    #[must_use]
    pub fn new(tx: mpsc::Sender<TaskEvent>, store: Arc<dyn TaskStore>) -> Self {
        Self { tx, store }
    }

    /// Emit one event: persist, then forward to the live stream.
    ///
    /// Event-log persistence failures are logged and swallowed — the log is
    /// observability, not task state. A dropped live receiver is likewise
    /// ignored; the task keeps running for reconnecting subscribers.
    pub async fn emit(&self, event: TaskEvent) {
        if let Err(err) = self.store.append_event(&event).await {
            warn!(task_id = %event.task_id, error = %err, "failed to persist task event");
        }
        if self.tx.send(event).await.is_err() {
            // Live subscriber went away; replay still works from the log.
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}
