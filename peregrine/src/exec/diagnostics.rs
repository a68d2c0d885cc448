//! Per-step diagnostic tracking.
//!
//! Records every tool attempt for a step so the prompt can warn the model
//! about repeated failures instead of letting it retry the same call
//! verbatim.

use serde_json::Value;

/// One recorded tool attempt.
#[derive(Debug, Clone)]
pub struct ToolAttempt {
    /// Tool name.
    pub tool: String,
    /// Stable fingerprint of tool + arguments.
    pub fingerprint: String,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Error text for failures.
    pub error: Option<String>,
}

/// Tracks attempts for one step and builds the diagnostic prompt block.
#[derive(Debug, Default)]
pub struct DiagnosticTracker {
    attempts: Vec<ToolAttempt>,
}

impl DiagnosticTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one attempt.
    pub fn record(&mut self, tool: &str, args: &Value, success: bool, error: Option<&str>) {
        self.attempts.push(ToolAttempt {
            tool: tool.to_owned(),
            fingerprint: fingerprint(tool, args),
            success,
            error: error.map(str::to_owned),
        });
    }

    /// How many times this exact call has already failed.
    #[must_use]
    pub fn failure_count(&self, tool: &str, args: &Value) -> usize {
        let fp = fingerprint(tool, args);
        self.attempts
            .iter()
            .filter(|a| !a.success && a.fingerprint == fp)
            .count()
    }

    /// Total attempts recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// The diagnostic context block for the prompt, or `None` when there is
    /// nothing worth warning about.
    #[must_use]
    pub fn diagnostic_block(&self) -> Option<String> {
        let failures: Vec<&ToolAttempt> = self.attempts.iter().filter(|a| !a.success).collect();
        if failures.is_empty() {
            return None;
        }

        let mut lines = vec!["Diagnostic notes from earlier attempts:".to_owned()];
        for attempt in failures.iter().rev().take(5).rev() {
            lines.push(format!(
                "- {} failed: {}",
                attempt.tool,
                attempt.error.as_deref().unwrap_or("unknown error")
            ));
        }

        // Flag verbatim repeats explicitly.
        let mut seen = std::collections::HashMap::new();
        for attempt in &failures {
            *seen.entry(attempt.fingerprint.as_str()).or_insert(0u32) += 1;
        }
        if seen.values().any(|&count| count >= 2) {
            lines.push(
                "An identical call already failed more than once. Do not repeat it \
                 with the same arguments; diagnose the error or try another tool."
                    .to_owned(),
            );
        }

        Some(lines.join("\n"))
    }
}

fn fingerprint(tool: &str, args: &Value) -> String {
    format!("{tool}:{args}")
}
