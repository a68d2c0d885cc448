//! Completion verification — `task_complete` claims checked against the
//! evidence chain.
//!
//! When configured, the verifier runs before a `task_complete` call is
//! honored. A rejection overwrites the tool record with the critique so
//! the model can correct itself; the step is not marked complete and the
//! attempt counter is untouched.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::evidence::EvidenceChain;
use crate::provider::{ChatMessage, LlmProvider, LlmRequest};

/// The verifier's verdict on a completion claim.
#[derive(Debug, Clone)]
pub struct Verdict {
    /// Whether the claim is supported by the evidence.
    pub passed: bool,
    /// Critique text (or a short confirmation on pass).
    pub critique: String,
}

impl Verdict {
    /// A passing verdict.
    #[must_use]
    pub fn pass(note: impl Into<String>) -> Self {
        Self {
            passed: true,
            critique: note.into(),
        }
    }

    /// A rejecting verdict.
    #[must_use]
    pub fn reject(critique: impl Into<String>) -> Self {
        Self {
            passed: false,
            critique: critique.into(),
        }
    }
}

/// Checks a claimed completion against the accumulated evidence.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Verify `summary` as a completion claim for `goal`.
    async fn verify(&self, goal: &str, summary: &str, evidence: &EvidenceChain) -> Verdict;
}

const VERIFIER_PROMPT: &str = "\
You are an independent verifier. Judge whether the agent's completion \
summary is fully supported by the recorded tool outputs. Reject summaries \
that claim actions with no matching tool evidence. Reply with a single \
line starting with PASS or FAIL, followed by a short justification.";

/// LLM-backed verifier that judges the summary against the tool-output
/// evidence recorded during the run.
pub struct EvidenceVerifier {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl EvidenceVerifier {
    /// Create a verifier bound to a provider and model.
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

impl std::fmt::Debug for EvidenceVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceVerifier")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Verifier for EvidenceVerifier {
    async fn verify(&self, goal: &str, summary: &str, evidence: &EvidenceChain) -> Verdict {
        let observed = evidence.observed_tools();
        let outputs: String = observed
            .iter()
            .flat_map(|tool| evidence.tool_outputs(tool))
            .map(|node| format!("- [{}] {}", node.source, node.content))
            .collect::<Vec<_>>()
            .join("\n");

        let user = format!(
            "Goal: {goal}\n\nClaimed completion summary:\n{summary}\n\n\
             Recorded tool outputs:\n{}",
            if outputs.is_empty() {
                "(none)"
            } else {
                outputs.as_str()
            }
        );

        let request = LlmRequest::new(
            &self.model,
            vec![ChatMessage::system(VERIFIER_PROMPT), ChatMessage::user(user)],
        )
        .temperature(0.1)
        .max_tokens(512);

        match self.provider.generate_with_tools(&request).await {
            Ok(response) => {
                let text = response.content.unwrap_or_default();
                let upper = text.trim_start().to_uppercase();
                if upper.starts_with("PASS") {
                    Verdict::pass(text)
                } else if upper.starts_with("FAIL") {
                    Verdict::reject(text)
                } else {
                    // Unparseable verdict: treat an evidence-free claim as
                    // rejected, anything else as passed.
                    if observed.is_empty() && !summary.is_empty() {
                        Verdict::reject(
                            "Verifier could not parse a verdict and no tool evidence \
                             supports the claimed completion.",
                        )
                    } else {
                        Verdict::pass(text)
                    }
                }
            }
            Err(err) => {
                // Verification is a quality gate, not a correctness one; a
                // broken verifier must not wedge completion.
                warn!(error = %err, "verifier call failed, accepting completion");
                Verdict::pass(format!("Verifier unavailable: {err}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{MockProvider, ScriptedTurn};

    #[tokio::test]
    async fn pass_and_fail_parsing() {
        let provider = Arc::new(MockProvider::new(
            "mock",
            vec![
                ScriptedTurn::Text("PASS - evidence supports the claim".to_owned()),
                ScriptedTurn::Text("FAIL - no file_delete output recorded".to_owned()),
            ],
        ));
        let verifier = EvidenceVerifier::new(provider, "m");
        let chain = EvidenceChain::new("t1");

        let first = verifier.verify("g", "did it", &chain).await;
        assert!(first.passed);

        let second = verifier.verify("g", "deleted the file", &chain).await;
        assert!(!second.passed);
        assert!(second.critique.contains("file_delete"));
    }

    #[tokio::test]
    async fn provider_failure_does_not_block_completion() {
        let provider = Arc::new(MockProvider::new(
            "mock",
            vec![ScriptedTurn::Error("down".to_owned())],
        ));
        let verifier = EvidenceVerifier::new(provider, "m");
        let chain = EvidenceChain::new("t1");

        let verdict = verifier.verify("g", "done", &chain).await;
        assert!(verdict.passed);
    }

    #[tokio::test]
    async fn unparseable_verdict_with_no_evidence_rejects() {
        let provider = Arc::new(MockProvider::new(
            "mock",
            vec![ScriptedTurn::Text("hmm, unclear".to_owned())],
        ));
        let verifier = EvidenceVerifier::new(provider, "m");
        let chain = EvidenceChain::new("t1");

        let verdict = verifier.verify("g", "I deleted the file", &chain).await;
        assert!(!verdict.passed);
    }
}
