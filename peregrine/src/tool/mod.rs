//! Tool definitions and the handler capability.
//!
//! Tools are the agent's only way to act on the world. The engine owns the
//! catalog ([`registry::ToolRegistry`]) and the dispatch rules; the handlers
//! themselves are consumed capabilities implemented outside the core.
//!
//! # Function-calling alignment
//!
//! [`ToolDefinition`] serializes to the `{"type": "function", "function":
//! {...}}` shape so it can be handed to any provider that speaks the
//! function-calling wire format.

pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::config::RiskLevel;
use crate::error::ToolError;

/// Name of the control tool that signals step completion.
pub const TASK_COMPLETE: &str = "task_complete";

/// Name of the control tool that asks the human a question.
pub const ASK_HUMAN: &str = "ask_human";

/// Whether a tool name is one of the always-registered control tools.
#[must_use]
pub fn is_control_tool(name: &str) -> bool {
    name == TASK_COMPLETE || name == ASK_HUMAN
}

/// Definition of a tool for LLM function calling.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (snake_case).
    pub name: String,
    /// What the tool does; guides the model's selection.
    pub description: String,
    /// JSON schema for the tool's parameters.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Custom serialization to the function-calling wire format.
impl Serialize for ToolDefinition {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;

        let mut function = serde_json::Map::new();
        function.insert("name".to_owned(), Value::String(self.name.clone()));
        function.insert(
            "description".to_owned(),
            Value::String(self.description.clone()),
        );
        function.insert("parameters".to_owned(), self.parameters.clone());

        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry("function", &function)?;
        map.end()
    }
}

/// The outcome of one tool dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the dispatch succeeded.
    pub success: bool,
    /// Tool output on success.
    pub output: String,
    /// Error text on failure.
    pub error: Option<String>,
    /// Wall time of the dispatch in milliseconds.
    pub execution_time_ms: u64,
}

impl ToolResult {
    /// A successful result.
    #[must_use]
    pub fn ok(output: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            execution_time_ms,
        }
    }

    /// A failed result.
    #[must_use]
    pub fn err(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            execution_time_ms,
        }
    }

    /// The text fed back to the model: output on success, error otherwise.
    #[must_use]
    pub fn text(&self) -> &str {
        if self.success {
            &self.output
        } else {
            self.error.as_deref().unwrap_or("")
        }
    }
}

/// Execution context passed to every handler invocation.
///
/// All ambient state (current workspace, task identity) travels here
/// explicitly; handlers never read globals.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Workspace the owning task belongs to.
    pub workspace_id: String,
    /// Id of the owning task.
    pub task_id: String,
}

impl ToolContext {
    /// Create a context for a task.
    #[must_use]
    pub fn new(workspace_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            task_id: task_id.into(),
        }
    }
}

/// The capability implemented by every tool.
///
/// Handlers must be safe to call concurrently from multiple tasks; any
/// internal locking is the handler's own concern.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool with validated arguments.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// A registered tool: definition, dispatch policy, and handler.
#[derive(Clone)]
pub struct ToolSpec {
    /// Function-calling definition.
    pub definition: ToolDefinition,
    /// Risk classification.
    pub risk_level: RiskLevel,
    /// Whether every call requires human approval.
    pub requires_approval: bool,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Free-form grouping used by the tool selector.
    pub category: String,
    /// The handler capability.
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolSpec {
    /// Default per-call timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a spec with default policy (low risk, no approval, 60s cap).
    #[must_use]
    pub fn new(definition: ToolDefinition, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            definition,
            risk_level: RiskLevel::Low,
            requires_approval: false,
            timeout: Self::DEFAULT_TIMEOUT,
            category: "general".to_owned(),
            handler,
        }
    }

    /// Sets the risk level.
    #[must_use]
    pub const fn risk(mut self, level: RiskLevel) -> Self {
        self.risk_level = level;
        self
    }

    /// Forces human approval for every call.
    #[must_use]
    pub const fn requires_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the selector category.
    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// The tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.definition.name)
            .field("risk_level", &self.risk_level)
            .field("requires_approval", &self.requires_approval)
            .field("timeout", &self.timeout)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_serializes_to_function_shape() {
        let def = ToolDefinition::new(
            "fetch_url",
            "Fetch a URL",
            serde_json::json!({
                "type": "object",
                "properties": {"url": {"type": "string"}},
                "required": ["url"]
            }),
        );
        let wire = serde_json::to_value(&def).unwrap();
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], "fetch_url");
        assert_eq!(wire["function"]["parameters"]["required"][0], "url");
    }

    #[test]
    fn control_tool_names() {
        assert!(is_control_tool(TASK_COMPLETE));
        assert!(is_control_tool(ASK_HUMAN));
        assert!(!is_control_tool("fetch_url"));
    }

    #[test]
    fn result_text_picks_side() {
        assert_eq!(ToolResult::ok("out", 5).text(), "out");
        assert_eq!(ToolResult::err("bad", 5).text(), "bad");
    }
}
