//! Checkpoints — task snapshots taken before risky tool dispatches.
//!
//! Before any `high` or `critical` risk tool runs, the executor snapshots
//! the task (plan, step statuses, counters, progress). If the dispatch
//! later needs rollback — verification rejection on a claimed completion is
//! the canonical case — the most recent checkpoint for the step restores
//! the plan. Counters are never rolled back; they are monotonic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::plan::Plan;
use crate::task::Task;

/// A snapshot of task state taken before a risky operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique id.
    pub id: String,
    /// Owning task.
    pub task_id: String,
    /// Step the risky call belonged to.
    pub step_id: String,
    /// Tool that triggered the snapshot.
    pub tool_name: String,
    /// The plan at snapshot time.
    pub plan: Option<Plan>,
    /// Iterations at snapshot time (informational).
    pub iterations: u32,
    /// Tool calls at snapshot time (informational).
    pub tool_calls_count: u32,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

/// Holds per-task checkpoints for the lifetime of a run.
#[derive(Debug, Default)]
pub struct CheckpointManager {
    checkpoints: Vec<Checkpoint>,
}

impl CheckpointManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the task before a risky dispatch.
    pub fn snapshot(&mut self, task: &Task, step_id: &str, tool_name: &str) -> &Checkpoint {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            step_id: step_id.to_owned(),
            tool_name: tool_name.to_owned(),
            plan: task.plan.clone(),
            iterations: task.iterations,
            tool_calls_count: task.tool_calls_count,
            created_at: Utc::now(),
        };
        debug!(
            task_id = %task.id,
            step_id,
            tool = tool_name,
            "checkpoint taken before risky dispatch"
        );
        self.checkpoints.push(checkpoint);
        self.checkpoints.last().expect("just pushed")
    }

    /// The most recent checkpoint for a step, if any.
    #[must_use]
    pub fn latest_for_step(&self, step_id: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().rev().find(|c| c.step_id == step_id)
    }

    /// Restore the most recent checkpoint for a step onto the task.
    ///
    /// Only the plan (step statuses, recorded progress) is restored;
    /// counters stay at their current values. Returns `true` when a
    /// checkpoint existed and was applied.
    pub fn restore_for_step(&self, task: &mut Task, step_id: &str) -> bool {
        let Some(checkpoint) = self.latest_for_step(step_id) else {
            return false;
        };
        info!(
            task_id = %task.id,
            step_id,
            checkpoint_id = %checkpoint.id,
            "restoring checkpoint"
        );
        task.plan = checkpoint.plan.clone();
        true
    }

    /// Number of retained checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// Whether no checkpoints are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Drop all checkpoints; called at task completion.
    pub fn clear(&mut self) {
        self.checkpoints.clear();
    }
}
