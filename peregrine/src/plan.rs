//! Plans and steps — the ordered work breakdown of a task.
//!
//! A [`Plan`] is an ordered list of [`Step`]s produced by the planner and
//! driven by the executor. Step status transitions are validated: `complete`
//! and `skipped` are final, and `failed -> in_progress` is only legal while
//! the retry budget ([`Step::MAX_ATTEMPTS`]) remains.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Status of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started.
    Pending,
    /// Currently being executed.
    InProgress,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Failed,
    /// Skipped (approval denied, or task completed early).
    Skipped,
}

impl StepStatus {
    /// Whether this status is terminal for ordinary execution.
    ///
    /// `Failed` is terminal only once the retry budget is spent; the
    /// transition validation in [`Step::transition`] encodes that.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Skipped)
    }

    /// Whether this status can never be left again.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }
}

/// One completed tool dispatch, recorded on the owning step.
///
/// The history is append-only and ordered by completion; `id` ties a record
/// back to the originating model tool call so consumers can re-pair results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Id of the originating tool call.
    pub id: String,
    /// Tool name.
    pub tool: String,
    /// Arguments the tool ran with.
    pub args: Value,
    /// Output on success, error text on failure.
    pub result: String,
    /// Whether the dispatch succeeded.
    pub success: bool,
    /// Wall time of the dispatch in milliseconds.
    pub time_ms: u64,
}

/// A unit of work inside a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique id.
    pub id: String,
    /// 0-based position in the plan.
    pub index: usize,
    /// What this step should accomplish.
    pub description: String,
    /// Current status.
    pub status: StepStatus,
    /// Append-only dispatch history.
    pub tool_calls: Vec<ToolCallRecord>,
    /// Final result text, once terminal.
    pub result: Option<String>,
    /// Most recent error, if any.
    pub error: Option<String>,
    /// Number of retries consumed (capped at [`Self::MAX_ATTEMPTS`]).
    pub attempts: u32,
    /// Tools the planner expects this step to use (routing hint).
    pub expected_tools: Vec<String>,
    /// When execution began.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    /// Maximum independent retries per step.
    pub const MAX_ATTEMPTS: u32 = 3;

    /// Create a pending step.
    #[must_use]
    pub fn new(index: usize, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            index,
            description: description.into(),
            status: StepStatus::Pending,
            tool_calls: Vec::new(),
            result: None,
            error: None,
            attempts: 0,
            expected_tools: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Sets the expected-tools routing hint.
    #[must_use]
    pub fn with_expected_tools(mut self, tools: Vec<String>) -> Self {
        self.expected_tools = tools;
        self
    }

    /// Validated status transition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] for transitions out of a final
    /// status, or `failed -> in_progress` once the retry budget is spent.
    pub fn transition(&mut self, to: StepStatus) -> Result<()> {
        let legal = match (self.status, to) {
            (StepStatus::Pending, StepStatus::InProgress | StepStatus::Skipped) => true,
            (
                StepStatus::InProgress,
                StepStatus::Complete | StepStatus::Failed | StepStatus::Skipped,
            ) => true,
            (StepStatus::Failed, StepStatus::InProgress) => self.attempts < Self::MAX_ATTEMPTS,
            (from, to) if from == to => true,
            _ => false,
        };

        if !legal {
            return Err(Error::invalid_state(
                format!("step:{:?}", self.status),
                format!("step:{to:?}"),
            ));
        }
        self.status = to;
        Ok(())
    }

    /// Mark the step in progress, stamping `started_at` on first entry.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::InvalidState`] from the transition check.
    pub fn begin(&mut self) -> Result<()> {
        self.transition(StepStatus::InProgress)?;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Mark the step complete with a result.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::InvalidState`] from the transition check.
    pub fn complete(&mut self, result: impl Into<String>) -> Result<()> {
        self.transition(StepStatus::Complete)?;
        self.result = Some(result.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the step failed with an error.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::InvalidState`] from the transition check.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(StepStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Mark the step skipped with an explanatory result.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::InvalidState`] from the transition check.
    pub fn skip(&mut self, result: impl Into<String>) -> Result<()> {
        self.transition(StepStatus::Skipped)?;
        self.result = Some(result.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Re-enter a failed step, consuming one retry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] when the retry budget is spent.
    pub fn retry(&mut self) -> Result<()> {
        self.transition(StepStatus::InProgress)?;
        self.attempts += 1;
        Ok(())
    }

    /// Whether retries remain for this step.
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.attempts < Self::MAX_ATTEMPTS
    }

    /// Append a dispatch record to the step history.
    pub fn record_tool_call(&mut self, record: ToolCallRecord) {
        self.tool_calls.push(record);
    }
}

/// An ordered sequence of steps realizing a goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Echo of the task goal.
    pub goal: String,
    /// Ordered steps.
    pub steps: Vec<Step>,
    /// How many times the plan was revised (capped by the executor).
    pub revision_count: u32,
    /// Planner rationale for this decomposition.
    pub reasoning: String,
}

impl Plan {
    /// Maximum plan revisions.
    pub const MAX_REVISIONS: u32 = 3;

    /// Create a plan from step descriptions.
    #[must_use]
    pub fn new(goal: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            goal: goal.into(),
            steps,
            revision_count: 0,
            reasoning: String::new(),
        }
    }

    /// Create the single-step fallback plan used when planning fails.
    #[must_use]
    pub fn fallback(goal: &str, reasoning: impl Into<String>) -> Self {
        let clipped: String = goal.chars().take(200).collect();
        let mut plan = Self::new(
            goal,
            vec![Step::new(0, format!("Execute the goal directly: {clipped}"))],
        );
        plan.reasoning = reasoning.into();
        plan
    }

    /// Sets the planner rationale.
    #[must_use]
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    /// `(terminal, total)` step counts.
    #[must_use]
    pub fn progress(&self) -> (usize, usize) {
        let done = self.steps.iter().filter(|s| s.status.is_terminal()).count();
        (done, self.steps.len())
    }

    /// Whether every step is terminal.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    /// Index of the first non-terminal step, if any.
    #[must_use]
    pub fn current_step_index(&self) -> Option<usize> {
        self.steps.iter().position(|s| !s.status.is_terminal())
    }

    /// The first non-terminal step, if any.
    #[must_use]
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| !s.status.is_terminal())
    }

    /// Mutable access to the first non-terminal step.
    pub fn current_step_mut(&mut self) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| !s.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_lifecycle() {
        let mut step = Step::new(0, "Fetch the page");
        assert_eq!(step.status, StepStatus::Pending);

        step.begin().unwrap();
        assert!(step.started_at.is_some());

        step.complete("done").unwrap();
        assert_eq!(step.status, StepStatus::Complete);
        assert_eq!(step.result.as_deref(), Some("done"));

        // Final statuses reject further transitions.
        assert!(step.transition(StepStatus::InProgress).is_err());
    }

    #[test]
    fn step_retry_budget() {
        let mut step = Step::new(0, "Flaky step");
        for _ in 0..Step::MAX_ATTEMPTS {
            step.begin().unwrap();
            step.fail("boom").unwrap();
            if step.can_retry() {
                step.retry().unwrap();
                step.transition(StepStatus::Failed).unwrap();
            }
        }
        assert_eq!(step.attempts, Step::MAX_ATTEMPTS);
        assert!(!step.can_retry());
        assert!(step.transition(StepStatus::InProgress).is_err());
    }

    #[test]
    fn plan_progress_and_current() {
        let mut plan = Plan::new(
            "do things",
            vec![Step::new(0, "first"), Step::new(1, "second")],
        );
        assert_eq!(plan.progress(), (0, 2));
        assert_eq!(plan.current_step_index(), Some(0));
        assert!(!plan.is_complete());

        plan.steps[0].begin().unwrap();
        plan.steps[0].complete("ok").unwrap();
        assert_eq!(plan.progress(), (1, 2));
        assert_eq!(plan.current_step_index(), Some(1));

        plan.steps[1].skip("not needed").unwrap();
        assert!(plan.is_complete());
        assert!(plan.current_step().is_none());
    }

    #[test]
    fn fallback_plan_clips_goal() {
        let long_goal = "x".repeat(400);
        let plan = Plan::fallback(&long_goal, "planning failed");
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.steps[0].description.len() <= 230);
    }
}
