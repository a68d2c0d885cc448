//! Run metrics — token, tool, and verifier tallies for one task.
//!
//! The executor feeds a [`MetricsCollector`] as it goes and emits compact
//! snapshots as `metrics_update` events so observers can track cost in
//! real time.

use serde::{Deserialize, Serialize};

use crate::provider::Usage;

/// Accumulated metrics for one task run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Number of LLM calls made.
    pub llm_calls: u32,
    /// Prompt tokens across all calls.
    pub prompt_tokens: u64,
    /// Completion tokens across all calls.
    pub completion_tokens: u64,
    /// Prompt tokens served from cache.
    pub cached_tokens: u64,
    /// Number of tool dispatches (retries included).
    pub tool_executions: u32,
    /// Tool dispatches that failed.
    pub tool_failures: u32,
    /// Total tool wall time in milliseconds.
    pub tool_time_total_ms: u64,
    /// Verifier passes.
    pub verifier_passes: u32,
    /// Verifier rejections.
    pub verifier_failures: u32,
}

impl RunMetrics {
    /// Total tokens consumed.
    #[must_use]
    pub const fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Mean tool wall time in milliseconds.
    #[must_use]
    pub const fn avg_tool_time_ms(&self) -> u64 {
        if self.tool_executions == 0 {
            0
        } else {
            self.tool_time_total_ms / self.tool_executions as u64
        }
    }
}

/// Collects metrics during a run.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    metrics: RunMetrics,
}

impl MetricsCollector {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one LLM call's usage.
    pub fn record_llm_call(&mut self, usage: Usage) {
        self.metrics.llm_calls += 1;
        self.metrics.prompt_tokens += usage.prompt_tokens;
        self.metrics.completion_tokens += usage.completion_tokens;
        self.metrics.cached_tokens += usage.cached_tokens;
    }

    /// Record one tool dispatch.
    pub const fn record_tool_execution(&mut self, time_ms: u64, success: bool) {
        self.metrics.tool_executions += 1;
        self.metrics.tool_time_total_ms += time_ms;
        if !success {
            self.metrics.tool_failures += 1;
        }
    }

    /// Record a verifier verdict.
    pub const fn record_verifier_result(&mut self, passed: bool) {
        if passed {
            self.metrics.verifier_passes += 1;
        } else {
            self.metrics.verifier_failures += 1;
        }
    }

    /// Current metrics snapshot.
    #[must_use]
    pub const fn snapshot(&self) -> RunMetrics {
        self.metrics
    }

    /// Compact JSON payload for `metrics_update` events.
    #[must_use]
    pub fn to_event_payload(&self) -> String {
        serde_json::json!({
            "llm_calls": self.metrics.llm_calls,
            "total_tokens": self.metrics.total_tokens(),
            "cached_tokens": self.metrics.cached_tokens,
            "tool_executions": self.metrics.tool_executions,
            "tool_failures": self.metrics.tool_failures,
            "avg_tool_time_ms": self.metrics.avg_tool_time_ms(),
        })
        .to_string()
    }
}
