//! Guardrail configuration and risk classification.
//!
//! A [`GuardrailConfig`] travels with every task and bounds its execution:
//! iteration, tool-call, token, and wall-clock budgets, plus the approval
//! policy (risk ceiling, forced-approval tools, blocked argument patterns).

use serde::{Deserialize, Serialize};

/// Risk classification for a tool.
///
/// Ordered: `Low < Medium < High < Critical`. A tool whose risk exceeds
/// [`GuardrailConfig::auto_approve_risk`] requires human approval before it
/// may be dispatched.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Read-only or otherwise harmless operations.
    #[default]
    Low,
    /// Operations with contained side effects.
    Medium,
    /// Destructive or externally-visible operations.
    High,
    /// Operations that can cause irreversible damage.
    Critical,
}

impl RiskLevel {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Whether a checkpoint should be taken before dispatching a tool at
    /// this risk level.
    #[must_use]
    pub const fn warrants_checkpoint(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution bounds and approval policy for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// Maximum reasoning-loop iterations.
    pub max_iterations: u32,
    /// Maximum tool dispatches (each retry attempt counts).
    pub max_tool_calls: u32,
    /// Maximum cumulative LLM tokens.
    pub max_tokens: u64,
    /// Maximum wall-clock run time in seconds.
    pub max_wall_time_seconds: u64,
    /// Highest risk level that may run without human approval.
    pub auto_approve_risk: RiskLevel,
    /// Regex patterns; any argument field matching one forces approval.
    pub blocked_patterns: Vec<String>,
    /// Tool names that always require approval regardless of risk.
    pub require_approval_tools: Vec<String>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_tool_calls: 30,
            max_tokens: 100_000,
            max_wall_time_seconds: 600,
            auto_approve_risk: RiskLevel::Medium,
            blocked_patterns: Vec::new(),
            require_approval_tools: Vec::new(),
        }
    }
}

impl GuardrailConfig {
    /// Sets the iteration budget.
    #[must_use]
    pub const fn max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    /// Sets the tool-call budget.
    #[must_use]
    pub const fn max_tool_calls(mut self, n: u32) -> Self {
        self.max_tool_calls = n;
        self
    }

    /// Sets the token budget.
    #[must_use]
    pub const fn max_tokens(mut self, n: u64) -> Self {
        self.max_tokens = n;
        self
    }

    /// Sets the wall-clock budget in seconds.
    #[must_use]
    pub const fn max_wall_time_seconds(mut self, n: u64) -> Self {
        self.max_wall_time_seconds = n;
        self
    }

    /// Sets the highest risk level that runs without approval.
    #[must_use]
    pub const fn auto_approve_risk(mut self, level: RiskLevel) -> Self {
        self.auto_approve_risk = level;
        self
    }

    /// Adds a blocked argument pattern.
    #[must_use]
    pub fn blocked_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.blocked_patterns.push(pattern.into());
        self
    }

    /// Adds a tool that always requires approval.
    #[must_use]
    pub fn require_approval_tool(mut self, tool: impl Into<String>) -> Self {
        self.require_approval_tools.push(tool.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert!(RiskLevel::High.warrants_checkpoint());
        assert!(!RiskLevel::Medium.warrants_checkpoint());
    }

    #[test]
    fn config_builder() {
        let config = GuardrailConfig::default()
            .max_tool_calls(2)
            .auto_approve_risk(RiskLevel::Low)
            .blocked_pattern(r"rm\s+-rf");

        assert_eq!(config.max_tool_calls, 2);
        assert_eq!(config.auto_approve_risk, RiskLevel::Low);
        assert_eq!(config.blocked_patterns.len(), 1);
        assert_eq!(config.max_iterations, 20);
    }
}
