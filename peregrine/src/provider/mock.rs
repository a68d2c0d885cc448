//! Scripted provider implementation for testing.
//!
//! [`MockProvider`] returns predefined turns in sequence, cycling when the
//! script runs out. Tests use it to drive the executor deterministically
//! without a model backend.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;

use super::{LlmProvider, LlmRequest, LlmResponse, TokenStream, ToolCallRequest, Usage};
use crate::error::{Error, Result};

/// One scripted provider turn.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Respond with plain text.
    Text(String),
    /// Respond with tool calls.
    ToolCalls(Vec<ToolCallRequest>),
    /// Respond with text alongside tool calls.
    TextAndToolCalls(String, Vec<ToolCallRequest>),
    /// Fail the call with a provider error.
    Error(String),
    /// Respond with neither text nor tool calls.
    Empty,
}

/// A provider that replays a fixed script.
#[derive(Debug)]
pub struct MockProvider {
    name: String,
    script: Vec<ScriptedTurn>,
    cursor: AtomicUsize,
    ready: AtomicBool,
    local: bool,
    context_window: u32,
    usage_per_turn: Usage,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockProvider {
    /// Create a mock provider with the given name and script.
    #[must_use]
    pub fn new(name: impl Into<String>, script: Vec<ScriptedTurn>) -> Self {
        Self {
            name: name.into(),
            script,
            cursor: AtomicUsize::new(0),
            ready: AtomicBool::new(true),
            local: false,
            context_window: 128_000,
            usage_per_turn: Usage::new(20, 10),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Mark this provider as a local backend.
    #[must_use]
    pub const fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Override the context window.
    #[must_use]
    pub const fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    /// Override the usage reported per turn.
    #[must_use]
    pub const fn with_usage(mut self, usage: Usage) -> Self {
        self.usage_per_turn = usage;
        self
    }

    /// Flip readiness at runtime.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Number of calls served so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Snapshot of every request received, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal request log mutex is poisoned.
    #[must_use]
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().expect("request log poisoned").clone()
    }

    fn next_turn(&self, request: &LlmRequest) -> ScriptedTurn {
        self.requests
            .lock()
            .expect("request log poisoned")
            .push(request.clone());
        if self.script.is_empty() {
            return ScriptedTurn::Text("No response".to_owned());
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.script[index % self.script.len()].clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream> {
        match self.next_turn(request) {
            ScriptedTurn::Text(text) | ScriptedTurn::TextAndToolCalls(text, _) => {
                let chunks: Vec<Result<String>> = text
                    .split_inclusive(' ')
                    .map(|chunk| Ok(chunk.to_owned()))
                    .collect();
                Ok(futures::stream::iter(chunks).boxed())
            }
            ScriptedTurn::Error(message) => Err(Error::provider(&self.name, message)),
            ScriptedTurn::ToolCalls(_) | ScriptedTurn::Empty => {
                let chunks: Vec<Result<String>> = Vec::new();
                Ok(futures::stream::iter(chunks).boxed())
            }
        }
    }

    async fn generate_with_tools(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let usage = Some(self.usage_per_turn);
        match self.next_turn(request) {
            ScriptedTurn::Text(text) => Ok(LlmResponse {
                content: Some(text),
                tool_calls: Vec::new(),
                usage,
            }),
            ScriptedTurn::ToolCalls(calls) => Ok(LlmResponse {
                content: None,
                tool_calls: calls,
                usage,
            }),
            ScriptedTurn::TextAndToolCalls(text, calls) => Ok(LlmResponse {
                content: Some(text),
                tool_calls: calls,
                usage,
            }),
            ScriptedTurn::Error(message) => Err(Error::provider(&self.name, message)),
            ScriptedTurn::Empty => Ok(LlmResponse {
                content: None,
                tool_calls: Vec::new(),
                usage,
            }),
        }
    }
}
