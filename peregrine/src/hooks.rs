//! Optional pre/post-task collaborators: learner and memory graph hooks.
//!
//! Neither capability is required for correctness. The executor calls them
//! around the run — context enrichment before planning, lesson extraction
//! and entity storage after completion — and logs, rather than propagates,
//! every failure.

use async_trait::async_trait;

use crate::error::Result;
use crate::task::Task;

/// Cross-task learning: lesson recall before a run, extraction after.
#[async_trait]
pub trait Learner: Send + Sync {
    /// A lesson block to prepend to the system prompt, or empty.
    async fn enrich_context(&self, workspace_id: &str, goal: &str) -> Result<String>;

    /// Extract reusable lessons from a finished task.
    async fn extract_lessons(&self, task: &Task) -> Result<()>;
}

/// Workspace-scoped entity/relationship memory.
#[async_trait]
pub trait MemoryGraph: Send + Sync {
    /// An "entities and relationships" context block for the prompt, or
    /// empty when nothing relevant is stored.
    async fn context_block(&self, workspace_id: &str, query_terms: &[String]) -> Result<String>;

    /// Extract entities and relations from a finished task's goal and
    /// result (typically one LLM call) and persist them.
    async fn store_extraction(
        &self,
        conversation_id: &str,
        workspace_id: &str,
        goal: &str,
        result: &str,
    ) -> Result<()>;
}

/// Key terms of a goal used to query the memory graph.
#[must_use]
pub fn goal_query_terms(goal: &str) -> Vec<String> {
    goal.split_whitespace()
        .filter(|w| w.len() > 3)
        .take(5)
        .map(str::to_owned)
        .collect()
}
