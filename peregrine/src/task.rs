//! Tasks — the unit of autonomous execution.
//!
//! A [`Task`] owns its plan, counters, pending approval, and outputs. While
//! running it is mutated exclusively by the executor; all other observers
//! read snapshots through the persistence adapter. Status transitions are
//! validated and terminal states are final.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::ApprovalRequest;
use crate::config::GuardrailConfig;
use crate::error::{Error, Result};
use crate::plan::Plan;
use crate::provider::ChatMessage;

/// Lifecycle states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Decomposing the goal into a plan.
    Planning,
    /// Driving the plan step by step.
    Executing,
    /// Integrating tool observations.
    Observing,
    /// Revising the plan against observations.
    Reflecting,
    /// Suspended on a human approval.
    WaitingApproval,
    /// Finished successfully. Terminal.
    Complete,
    /// Finished with an error. Terminal.
    Failed,
    /// Cancelled by an external caller. Terminal.
    Cancelled,
    /// Paused; may be resumed.
    Paused,
}

impl TaskStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Observing => "observing",
            Self::Reflecting => "reflecting",
            Self::WaitingApproval => "waiting_approval",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One autonomous goal-driven run, bounded by guardrails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique id.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Conversation this task is embedded in, if any.
    pub conversation_id: Option<String>,
    /// The natural-language goal.
    pub goal: String,
    /// Pre-seeded conversation history for chat-embedded tasks.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Execution bounds and approval policy.
    pub config: GuardrailConfig,
    /// Current status.
    pub status: TaskStatus,
    /// The plan, once created.
    pub plan: Option<Plan>,
    /// The approval currently gating execution, if any.
    pub pending_approval: Option<ApprovalRequest>,
    /// Reasoning-loop iterations consumed. Monotonic.
    pub iterations: u32,
    /// Tool dispatches performed (retries included). Monotonic.
    pub tool_calls_count: u32,
    /// Cumulative LLM tokens. Monotonic.
    pub token_usage: u64,
    /// Final summary, once complete.
    pub result: Option<String>,
    /// Failure reason, once failed.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When execution began.
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal status was reached.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new task in the `Planning` state.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        workspace_id: impl Into<String>,
        goal: impl Into<String>,
        config: GuardrailConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
            conversation_id: None,
            goal: goal.into(),
            messages: Vec::new(),
            config,
            status: TaskStatus::Planning,
            plan: None,
            pending_approval: None,
            iterations: 0,
            tool_calls_count: 0,
            token_usage: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Attaches a conversation id.
    #[must_use]
    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Pre-seeds conversation history, making this a chat-embedded task.
    #[must_use]
    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    /// Whether this task is embedded in a chat conversation.
    #[must_use]
    pub fn is_chat_embedded(&self) -> bool {
        !self.messages.is_empty()
    }

    /// Validated status transition. Terminal states are final.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] for transitions out of a terminal
    /// state or between unrelated phases.
    pub fn transition(&mut self, to: TaskStatus) -> Result<()> {
        use TaskStatus as S;

        let legal = match (self.status, to) {
            (from, _) if from.is_terminal() => false,
            (from, to) if from == to => true,
            (S::Planning, S::Executing) => true,
            (S::Executing, S::Observing | S::Reflecting | S::WaitingApproval | S::Paused) => true,
            (S::Observing | S::Reflecting | S::WaitingApproval | S::Paused, S::Executing) => true,
            // Any live state may reach a terminal one.
            (_, S::Complete | S::Failed | S::Cancelled) => true,
            _ => false,
        };

        if !legal {
            return Err(Error::invalid_state(
                self.status.as_str(),
                to.as_str(),
            ));
        }
        self.status = to;
        Ok(())
    }

    /// Enter the `Executing` state, stamping `started_at` on first entry.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::InvalidState`] from the transition check.
    pub fn begin_execution(&mut self) -> Result<()> {
        self.transition(TaskStatus::Executing)?;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Mark the task complete with a final summary.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::InvalidState`] from the transition check.
    pub fn complete(&mut self, result: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Complete)?;
        self.result = Some(result.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task failed with a human-readable reason.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::InvalidState`] from the transition check.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task cancelled.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::InvalidState`] from the transition check.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(TaskStatus::Cancelled)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Consume one loop iteration.
    pub const fn record_iteration(&mut self) {
        self.iterations += 1;
    }

    /// Consume one tool dispatch.
    pub const fn record_tool_call(&mut self) {
        self.tool_calls_count += 1;
    }

    /// Add LLM tokens to the running total.
    pub const fn add_token_usage(&mut self, tokens: u64) {
        self.token_usage += tokens;
    }

    /// Synthesize the final result text from terminal step results.
    ///
    /// Chat-embedded tasks get the raw step results; autonomous tasks get
    /// them prefixed with the step description.
    #[must_use]
    pub fn synthesize_result(&self) -> String {
        let Some(plan) = &self.plan else {
            return "Task completed successfully.".to_owned();
        };
        let parts: Vec<String> = plan
            .steps
            .iter()
            .filter_map(|s| {
                s.result.as_ref().map(|r| {
                    if self.is_chat_embedded() {
                        r.clone()
                    } else {
                        format!("**{}**: {r}", s.description)
                    }
                })
            })
            .collect();
        if parts.is_empty() {
            "Task completed successfully.".to_owned()
        } else {
            parts.join("\n")
        }
    }
}

/// Compact task view returned by list queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Task id.
    pub id: String,
    /// The goal.
    pub goal: String,
    /// Current status.
    pub status: TaskStatus,
    /// Iterations consumed.
    pub iterations: u32,
    /// Tool dispatches performed.
    pub tool_calls: u32,
    /// Final result, if any.
    pub result: Option<String>,
    /// Failure reason, if any.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time, if terminal.
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            goal: task.goal.clone(),
            status: task.status,
            iterations: task.iterations,
            tool_calls: task.tool_calls_count,
            result: task.result.clone(),
            error: task.error.clone(),
            created_at: task.created_at,
            completed_at: task.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Step;

    fn task() -> Task {
        Task::new("user-1", "ws-1", "test goal", GuardrailConfig::default())
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut t = task();
        assert_eq!(t.status, TaskStatus::Planning);

        t.begin_execution().unwrap();
        assert!(t.started_at.is_some());

        t.transition(TaskStatus::WaitingApproval).unwrap();
        t.transition(TaskStatus::Executing).unwrap();

        t.complete("all done").unwrap();
        assert_eq!(t.status, TaskStatus::Complete);
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut t = task();
        t.begin_execution().unwrap();
        t.cancel().unwrap();

        assert!(t.transition(TaskStatus::Executing).is_err());
        assert!(t.fail("late").is_err());
        // The error text is never overwritten after a terminal transition.
        assert!(t.error.is_none());
    }

    #[test]
    fn illegal_phase_jump() {
        let mut t = task();
        assert!(t.transition(TaskStatus::Reflecting).is_err());
    }

    #[test]
    fn counters_are_monotonic() {
        let mut t = task();
        t.record_iteration();
        t.record_tool_call();
        t.add_token_usage(100);
        assert_eq!((t.iterations, t.tool_calls_count, t.token_usage), (1, 1, 100));
    }

    #[test]
    fn result_synthesis_prefixes_step_descriptions() {
        let mut t = task();
        let mut step = Step::new(0, "Fetch data");
        step.begin().unwrap();
        step.complete("42 rows").unwrap();
        t.plan = Some(Plan::new("test goal", vec![step]));

        assert_eq!(t.synthesize_result(), "**Fetch data**: 42 rows");

        t.messages = vec![ChatMessage::user("hi")];
        assert_eq!(t.synthesize_result(), "42 rows");
    }
}
