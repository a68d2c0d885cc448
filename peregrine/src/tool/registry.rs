//! Tool registry and dispatcher.
//!
//! The registry owns the tool catalog and performs single dispatches:
//! argument validation against the parameter schema, the per-tool timeout,
//! and wall-time measurement. Failure classification
//! ([`is_transient_error`]) decides retryability; the retry loop itself is
//! driven by the executor so every attempt emits its own event pair.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::{
    ASK_HUMAN, TASK_COMPLETE, ToolContext, ToolDefinition, ToolHandler, ToolResult, ToolSpec,
};
use crate::config::RiskLevel;
use crate::error::ToolError;
use crate::provider::ToolCallRequest;

/// Maximum retry attempts for a transient tool failure.
pub const RETRY_MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential retry backoff.
pub const RETRY_BASE_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Error fragments that mark a failure as transient (retryable).
const TRANSIENT_MARKERS: [&str; 8] = [
    "timeout",
    "rate limit",
    "connection",
    "network",
    "503",
    "502",
    "429",
    "temporarily unavailable",
];

/// Whether an error message describes a transient failure.
#[must_use]
pub fn is_transient_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Backoff delay before retry `attempt` (0-based): 1s, 2s, 4s.
#[must_use]
pub fn retry_delay(attempt: u32) -> std::time::Duration {
    RETRY_BASE_DELAY * 2u32.saturating_pow(attempt)
}

/// Owns the set of registered tools and dispatches calls against them.
///
/// Read-only after registration; shared across tasks behind an `Arc`.
#[derive(Debug)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolSpec>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create a registry pre-populated with the control tools.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
        };
        registry.register(task_complete_spec());
        registry.register(ask_human_spec());
        registry
    }

    /// Register a tool, replacing any previous spec with the same name.
    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name().to_owned(), spec);
    }

    /// Look up a tool spec by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Whether a tool is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Number of registered tools (control tools included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry holds no tools.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All registered specs, unordered.
    #[must_use]
    pub fn specs(&self) -> Vec<&ToolSpec> {
        self.tools.values().collect()
    }

    /// Function-calling definitions for the whole catalog.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|s| s.definition.clone()).collect()
    }

    /// Risk level of a tool; unknown tools default to `Low`.
    #[must_use]
    pub fn risk_level(&self, name: &str) -> RiskLevel {
        self.tools.get(name).map_or(RiskLevel::Low, |s| s.risk_level)
    }

    /// Perform one dispatch: validate, run under the per-tool timeout,
    /// measure wall time. Never returns `Err` — every failure is folded
    /// into the [`ToolResult`] so the model can observe it.
    pub async fn dispatch(&self, call: &ToolCallRequest, ctx: &ToolContext) -> ToolResult {
        let started = tokio::time::Instant::now();
        let elapsed_ms = |started: tokio::time::Instant| {
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
        };

        let Some(spec) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "tool not found");
            return ToolResult::err(
                ToolError::NotFound(call.name.clone()).to_string(),
                elapsed_ms(started),
            );
        };

        if let Err(message) = validate_args(&spec.definition.parameters, &call.arguments) {
            return ToolResult::err(
                ToolError::InvalidArguments(message).to_string(),
                elapsed_ms(started),
            );
        }

        debug!(tool = %call.name, id = %call.id, "dispatching tool");

        let outcome = tokio::time::timeout(
            spec.timeout,
            spec.handler.execute(call.arguments.clone(), ctx),
        )
        .await;

        let time_ms = elapsed_ms(started);
        match outcome {
            Ok(Ok(value)) => {
                let output = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                ToolResult::ok(output, time_ms)
            }
            Ok(Err(err)) => {
                warn!(tool = %call.name, error = %err, "tool execution failed");
                ToolResult::err(err.to_string(), time_ms)
            }
            Err(_) => {
                warn!(tool = %call.name, timeout = ?spec.timeout, "tool timed out");
                ToolResult::err(
                    ToolError::Timeout(spec.timeout.as_secs()).to_string(),
                    time_ms,
                )
            }
        }
    }
}

/// Validate arguments against a JSON-schema subset: `required` fields and
/// primitive `type` declarations under `properties`.
fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    let empty = serde_json::Map::new();
    let object = match args {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(format!("expected an object, got {}", type_name(other)));
        }
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(field) {
                return Err(format!("missing required field `{field}`"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (field, value) in object {
            let Some(expected) = properties
                .get(field)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if !type_matches(expected, value) {
                return Err(format!(
                    "field `{field}` expected {expected}, got {}",
                    type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Handler behind `task_complete`; echoes the summary. The executor
/// intercepts the call to mark the step complete.
struct TaskCompleteHandler;

#[async_trait::async_trait]
impl ToolHandler for TaskCompleteHandler {
    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let summary = args
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or("Task completed.");
        Ok(Value::String(summary.to_owned()))
    }
}

/// Handler behind `ask_human`; echoes the question. The executor intercepts
/// the call to raise an approval request.
struct AskHumanHandler;

#[async_trait::async_trait]
impl ToolHandler for AskHumanHandler {
    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let question = args
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or("The agent needs your input");
        Ok(Value::String(question.to_owned()))
    }
}

fn task_complete_spec() -> ToolSpec {
    ToolSpec::new(
        ToolDefinition::new(
            TASK_COMPLETE,
            "Signal that the current step is finished, with a summary of what was accomplished.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "summary": {
                        "type": "string",
                        "description": "What was accomplished in this step"
                    }
                },
                "required": ["summary"]
            }),
        ),
        Arc::new(TaskCompleteHandler),
    )
    .category("control")
}

fn ask_human_spec() -> ToolSpec {
    ToolSpec::new(
        ToolDefinition::new(
            ASK_HUMAN,
            "Ask the human operator a question and wait for their answer.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "question": {
                        "type": "string",
                        "description": "The question to ask"
                    }
                },
                "required": ["question"]
            }),
        ),
        Arc::new(AskHumanHandler),
    )
    .category("control")
}
