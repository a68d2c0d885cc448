//! Guardrails — budget checks and approval gating.
//!
//! Every loop iteration and every tool dispatch passes through here.
//! [`Guardrails::check_budget`] bounds the run; [`Guardrails::needs_approval`]
//! decides whether a tool call must pause for a human.

use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::config::GuardrailConfig;
use crate::task::Task;
use crate::tool::registry::ToolRegistry;

/// Stateless guardrail checks. Config travels with the task.
#[derive(Debug, Clone, Copy, Default)]
pub struct Guardrails;

impl Guardrails {
    /// Create the guardrail checker.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns a descriptive error when any budget is exhausted.
    ///
    /// `elapsed` is the monotonic wall time since execution started.
    #[must_use]
    pub fn check_budget(&self, task: &Task, elapsed: Duration) -> Option<String> {
        let config = &task.config;
        if task.iterations >= config.max_iterations {
            return Some("iteration budget exceeded".to_owned());
        }
        if task.tool_calls_count >= config.max_tool_calls {
            return Some("tool-call budget exceeded".to_owned());
        }
        if task.token_usage >= config.max_tokens {
            return Some("token budget exceeded".to_owned());
        }
        if elapsed.as_secs() >= config.max_wall_time_seconds {
            return Some("wall-clock budget exceeded".to_owned());
        }
        None
    }

    /// Returns the reason a tool call needs human approval, if it does.
    ///
    /// Checks, in order: tool risk above the auto-approve ceiling, the
    /// forced-approval list, and blocked argument patterns.
    #[must_use]
    pub fn needs_approval(
        &self,
        tool_name: &str,
        args: &Value,
        config: &GuardrailConfig,
        registry: &ToolRegistry,
    ) -> Option<String> {
        let risk = registry.risk_level(tool_name);
        if risk > config.auto_approve_risk {
            return Some(format!(
                "tool '{tool_name}' risk level {risk} exceeds auto-approve ceiling {}",
                config.auto_approve_risk
            ));
        }

        if registry
            .get(tool_name)
            .is_some_and(|spec| spec.requires_approval)
            || config.require_approval_tools.iter().any(|t| t == tool_name)
        {
            return Some(format!("tool '{tool_name}' always requires approval"));
        }

        if let Some(pattern) = self.matched_blocked_pattern(args, config) {
            return Some(format!(
                "arguments of '{tool_name}' match blocked pattern '{pattern}'"
            ));
        }

        None
    }

    fn matched_blocked_pattern<'a>(
        &self,
        args: &Value,
        config: &'a GuardrailConfig,
    ) -> Option<&'a str> {
        if config.blocked_patterns.is_empty() {
            return None;
        }

        let mut fields = Vec::new();
        collect_strings(args, &mut fields);

        for pattern in &config.blocked_patterns {
            let Ok(regex) = Regex::new(pattern) else {
                warn!(pattern, "invalid blocked pattern, skipping");
                continue;
            };
            if fields.iter().any(|field| regex.is_match(field)) {
                return Some(pattern);
            }
        }
        None
    }
}

/// Collect every string leaf of an argument value.
fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskLevel;
    use crate::tool::{ToolContext, ToolDefinition, ToolHandler, ToolSpec};
    use std::sync::Arc;

    struct NoopHandler;

    #[async_trait::async_trait]
    impl ToolHandler for NoopHandler {
        async fn execute(
            &self,
            _args: Value,
            _ctx: &ToolContext,
        ) -> Result<Value, crate::error::ToolError> {
            Ok(Value::Null)
        }
    }

    fn registry_with(name: &str, risk: RiskLevel) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolSpec::new(
                ToolDefinition::new(name, "test tool", serde_json::json!({})),
                Arc::new(NoopHandler),
            )
            .risk(risk),
        );
        registry
    }

    #[test]
    fn budget_checks_fire_in_order() {
        let guardrails = Guardrails::new();
        let mut task = Task::new(
            "u",
            "ws",
            "g",
            GuardrailConfig::default().max_iterations(2).max_tool_calls(1),
        );

        assert!(guardrails.check_budget(&task, Duration::ZERO).is_none());

        task.record_iteration();
        task.record_iteration();
        let err = guardrails.check_budget(&task, Duration::ZERO).unwrap();
        assert!(err.contains("iteration budget exceeded"));
    }

    #[test]
    fn wall_clock_budget() {
        let guardrails = Guardrails::new();
        let task = Task::new(
            "u",
            "ws",
            "g",
            GuardrailConfig::default().max_wall_time_seconds(10),
        );
        assert!(guardrails
            .check_budget(&task, Duration::from_secs(9))
            .is_none());
        assert!(guardrails
            .check_budget(&task, Duration::from_secs(10))
            .unwrap()
            .contains("wall-clock"));
    }

    #[test]
    fn risk_above_ceiling_needs_approval() {
        let guardrails = Guardrails::new();
        let registry = registry_with("shell_execute", RiskLevel::High);
        let config = GuardrailConfig::default().auto_approve_risk(RiskLevel::Medium);

        let reason = guardrails.needs_approval(
            "shell_execute",
            &serde_json::json!({"command": "ls"}),
            &config,
            &registry,
        );
        assert!(reason.unwrap().contains("risk level high"));
    }

    #[test]
    fn forced_approval_tool() {
        let guardrails = Guardrails::new();
        let registry = registry_with("fetch_url", RiskLevel::Low);
        let config = GuardrailConfig::default().require_approval_tool("fetch_url");

        let reason =
            guardrails.needs_approval("fetch_url", &serde_json::json!({}), &config, &registry);
        assert!(reason.unwrap().contains("always requires approval"));
    }

    #[test]
    fn blocked_pattern_matches_nested_args() {
        let guardrails = Guardrails::new();
        let registry = registry_with("shell_execute", RiskLevel::Low);
        let config = GuardrailConfig::default().blocked_pattern(r"rm\s+-rf");

        let args = serde_json::json!({"script": {"lines": ["cd /tmp", "rm -rf x"]}});
        let reason = guardrails.needs_approval("shell_execute", &args, &config, &registry);
        assert!(reason.unwrap().contains("blocked pattern"));

        let safe = serde_json::json!({"script": {"lines": ["ls"]}});
        assert!(guardrails
            .needs_approval("shell_execute", &safe, &config, &registry)
            .is_none());
    }

    #[test]
    fn invalid_pattern_is_skipped() {
        let guardrails = Guardrails::new();
        let registry = registry_with("t", RiskLevel::Low);
        let config = GuardrailConfig::default().blocked_pattern("([unclosed");

        assert!(guardrails
            .needs_approval("t", &serde_json::json!({"x": "anything"}), &config, &registry)
            .is_none());
    }
}
