//! Human-in-the-loop approval requests.
//!
//! When a tool dispatch trips the guardrails (risk above the auto-approve
//! ceiling, a forced-approval tool, or a blocked argument pattern), or when
//! the model calls `ask_human`, the executor creates an [`ApprovalRequest`],
//! persists it, and suspends the step until an external caller resolves it
//! or the wait window expires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::RiskLevel;

/// Lifecycle of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for a human decision.
    Pending,
    /// Approved; the gated tool may run.
    Approved,
    /// Denied; the step is skipped.
    Denied,
    /// No decision arrived inside the wait window.
    Expired,
}

impl ApprovalStatus {
    /// Whether this status is a final decision.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A pending human decision gating a tool dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique id of this request.
    pub id: String,
    /// The task that raised it.
    pub task_id: String,
    /// The step that raised it.
    pub step_id: String,
    /// Name of the gated tool.
    pub tool_name: String,
    /// Arguments of the gated call.
    pub tool_args: Value,
    /// Risk classification of the gated tool.
    pub risk_level: RiskLevel,
    /// Human-readable reason the guardrails fired.
    pub reason: String,
    /// Current status.
    pub status: ApprovalStatus,
    /// Who resolved the request, once resolved.
    pub decided_by: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Create a new pending approval request.
    #[must_use]
    pub fn new(
        task_id: impl Into<String>,
        step_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_args: Value,
        risk_level: RiskLevel,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            step_id: step_id.into(),
            tool_name: tool_name.into(),
            tool_args,
            risk_level,
            reason: reason.into(),
            status: ApprovalStatus::Pending,
            decided_by: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this request still awaits a decision.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.status, ApprovalStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_request_is_pending() {
        let request = ApprovalRequest::new(
            "task-1",
            "step-1",
            "shell_execute",
            serde_json::json!({"command": "rm -rf /tmp/x"}),
            RiskLevel::High,
            "risk level high exceeds auto-approve ceiling",
        );
        assert!(request.is_pending());
        assert!(!request.status.is_resolved());
        assert!(!request.id.is_empty());
    }

    #[test]
    fn resolved_statuses() {
        assert!(ApprovalStatus::Approved.is_resolved());
        assert!(ApprovalStatus::Denied.is_resolved());
        assert!(ApprovalStatus::Expired.is_resolved());
        assert!(!ApprovalStatus::Pending.is_resolved());
    }
}
