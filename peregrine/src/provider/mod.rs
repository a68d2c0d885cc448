//! LLM provider abstraction.
//!
//! The engine never talks to a model API directly; it consumes the
//! [`LlmProvider`] capability. Implementations live outside the core (HTTP
//! clients for hosted APIs, a local inference server, etc.); the crate ships
//! only the scripted [`MockProvider`](mock::MockProvider) used by tests.
//!
//! Providers are resolved by name through a [`ProviderRegistry`], which also
//! answers the router's availability checks via [`ProviderDirectory`].

pub mod mock;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::Result;
use crate::tool::ToolDefinition;

/// Fixed priority order for cloud failover and escalation.
pub const CLOUD_PRIORITY: [&str; 3] = ["google", "openai", "anthropic"];

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// A tool result being fed back to the model.
    Tool,
}

/// One message in a model conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who produced the message.
    pub role: Role,
    /// Text content; absent for pure tool-call turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls requested by the assistant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// For `Tool` messages: the call this result answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant turn carrying tool calls.
    #[must_use]
    pub fn assistant_tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    /// Create a tool-result message answering `call_id`.
    #[must_use]
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    /// Approximate token count of this message (chars / 4 heuristic).
    #[must_use]
    pub fn estimated_tokens(&self) -> u32 {
        let content_len = self.content.as_deref().map_or(0, str::len);
        let calls_len: usize = self
            .tool_calls
            .iter()
            .map(|c| c.name.len() + c.arguments.to_string().len())
            .sum();
        u32::try_from((content_len + calls_len) / 4 + 4).unwrap_or(u32::MAX)
    }
}

/// A request from the model to run a named tool.
///
/// On the wire this is the function-calling shape
/// `{"id": ..., "type": "function", "function": {"name": ..., "arguments": "<json>"}}`;
/// in memory the arguments are an already-parsed [`Value`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Provider-assigned call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Structured arguments.
    pub arguments: Value,
}

impl ToolCallRequest {
    /// Create a tool call request.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

impl Serialize for ToolCallRequest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;

        let mut function = serde_json::Map::new();
        function.insert("name".to_owned(), Value::String(self.name.clone()));
        function.insert(
            "arguments".to_owned(),
            Value::String(self.arguments.to_string()),
        );

        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry("function", &function)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ToolCallRequest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("call")
            .to_owned();
        let function = raw
            .get("function")
            .ok_or_else(|| D::Error::missing_field("function"))?;
        let name = function
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| D::Error::missing_field("name"))?
            .to_owned();
        // Arguments may arrive JSON-encoded (the wire form) or already
        // structured; malformed argument text degrades to an empty object
        // so the dispatcher's schema validation can report it.
        let arguments = match function.get("arguments") {
            Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::Object(
                serde_json::Map::new(),
            )),
            Some(v) => v.clone(),
            None => Value::Object(serde_json::Map::new()),
        };
        Ok(Self { id, name, arguments })
    }
}

/// Token usage reported by a provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens generated.
    pub completion_tokens: u64,
    /// Prompt tokens served from cache.
    pub cached_tokens: u64,
}

impl Usage {
    /// Create a usage record.
    #[must_use]
    pub const fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            cached_tokens: 0,
        }
    }

    /// Total tokens for budget accounting.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.cached_tokens += rhs.cached_tokens;
    }
}

/// A chat completion request to a provider.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    /// Model identifier; empty selects the provider default.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Tools offered as function-call schemas. Empty forbids tool calls.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
}

impl LlmRequest {
    /// Create a request for a model with messages.
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            temperature: 0.7,
            max_tokens: 4096,
        }
    }

    /// Sets the tool schemas.
    #[must_use]
    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Sets the temperature.
    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the generation cap.
    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// A provider's answer to a [`LlmRequest`].
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    /// Text content, if any.
    pub content: Option<String>,
    /// Tool calls, if any.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Token usage, when the provider reports it.
    pub usage: Option<Usage>,
}

impl LlmResponse {
    /// A text-only response.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// Whether the response carries neither text nor tool calls.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty()
            && self.content.as_deref().is_none_or(|c| c.trim().is_empty())
    }
}

/// A stream of generated text chunks.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// The capability consumed for every model call.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Registry name of this provider (e.g. "ollama", "google").
    fn name(&self) -> &str;

    /// Whether the backend can currently serve requests.
    fn is_ready(&self) -> bool {
        true
    }

    /// Whether this backend runs locally (eligible for cloud failover).
    fn is_local(&self) -> bool {
        false
    }

    /// Context window in tokens, used for compaction decisions.
    fn context_window(&self) -> u32 {
        128_000
    }

    /// Stream a plain-text completion.
    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream>;

    /// One-shot completion with function calling.
    async fn generate_with_tools(&self, request: &LlmRequest) -> Result<LlmResponse>;
}

/// Name-based availability lookup consumed by the model router.
pub trait ProviderDirectory: Send + Sync {
    /// Whether the named provider is registered and ready.
    fn is_ready(&self, name: &str) -> bool;
}

/// A set of named providers shared by the engine.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.name().to_owned(), provider);
    }

    /// Look up a provider by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(name).cloned()
    }

    /// Whether any provider is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Ready cloud providers in [`CLOUD_PRIORITY`] order.
    #[must_use]
    pub fn ready_cloud_providers(&self) -> Vec<Arc<dyn LlmProvider>> {
        CLOUD_PRIORITY
            .iter()
            .filter_map(|name| self.get(name))
            .filter(|p| p.is_ready())
            .collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderDirectory for ProviderRegistry {
    fn is_ready(&self, name: &str) -> bool {
        self.providers.get(name).is_some_and(|p| p.is_ready())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_request_wire_roundtrip() {
        let call = ToolCallRequest::new("call_1", "fetch_url", serde_json::json!({"url": "x"}));
        let wire = serde_json::to_value(&call).unwrap();

        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], "fetch_url");
        // Arguments are JSON-encoded on the wire.
        assert!(wire["function"]["arguments"].is_string());

        let back: ToolCallRequest = serde_json::from_value(wire).unwrap();
        assert_eq!(back, call);
    }

    #[test]
    fn tool_call_request_accepts_structured_arguments() {
        let wire = serde_json::json!({
            "id": "c1",
            "type": "function",
            "function": {"name": "echo", "arguments": {"message": "hi"}}
        });
        let call: ToolCallRequest = serde_json::from_value(wire).unwrap();
        assert_eq!(call.arguments["message"], "hi");
    }

    #[test]
    fn empty_response_detection() {
        assert!(LlmResponse::default().is_empty());
        assert!(LlmResponse::text("  ").is_empty());
        assert!(!LlmResponse::text("hello").is_empty());
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total += Usage::new(100, 50);
        total += Usage::new(10, 5);
        assert_eq!(total.total(), 165);
    }

    #[test]
    fn registry_directory() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(mock::MockProvider::new("ollama", vec![])));
        assert!(ProviderDirectory::is_ready(&registry, "ollama"));
        assert!(!ProviderDirectory::is_ready(&registry, "google"));
    }
}
