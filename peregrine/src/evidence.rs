//! Evidence chain — auditable decision trail for every agent action.
//!
//! Every decision the engine makes (plan choice, tool selection, skip,
//! escalation, approval) is recorded with its reasoning, the evidence that
//! supported it, the alternatives that were rejected, and a confidence
//! score. The chain is append-only during execution and persisted in one
//! batch when the task completes; an audit report can be generated for
//! external review.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// Kinds of evidence that can support a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    /// Result from a tool call.
    ToolOutput,
    /// Something the user said.
    UserInput,
    /// Context from the memory graph.
    MemoryGraph,
    /// A lesson from post-task learning.
    LessonLearned,
    /// Output of a self-critique pass.
    Reflection,
    /// Documentation or files that were read.
    Documentation,
    /// Web search results.
    WebSearch,
    /// Reference to an earlier decision.
    PriorDecision,
    /// A built-in rule.
    Heuristic,
}

/// A single piece of evidence supporting a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceNode {
    /// Short id.
    pub id: String,
    /// Kind of evidence.
    #[serde(rename = "type")]
    pub evidence_type: EvidenceType,
    /// The evidence itself (clipped to 500 chars on record).
    pub content: String,
    /// Where it came from (tool name, file, ...).
    pub source: String,
    /// How relevant it was, 0.0 to 1.0.
    pub relevance: f64,
}

impl EvidenceNode {
    /// Create an evidence node, clipping the content.
    #[must_use]
    pub fn new(
        evidence_type: EvidenceType,
        content: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let mut content = content.into();
        content.truncate(content.char_indices().nth(500).map_or(content.len(), |(i, _)| i));
        Self {
            id: Uuid::new_v4().to_string()[..8].to_owned(),
            evidence_type,
            content,
            source: source.into(),
            relevance: 1.0,
        }
    }

    /// Sets the relevance score.
    #[must_use]
    pub const fn relevance(mut self, relevance: f64) -> Self {
        self.relevance = relevance;
        self
    }
}

/// Kinds of decisions the engine records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    /// Chose a plan or approach.
    PlanChoice,
    /// Chose which tool to use.
    ToolSelection,
    /// Chose parameter values.
    Parameter,
    /// High-level strategy.
    Strategy,
    /// Decided not to do something.
    Skip,
    /// Delegated to another agent.
    Delegate,
    /// Auto-approved an action.
    Approve,
    /// Escalated to the user or a stronger model.
    Escalate,
}

/// A recorded decision with its full evidence trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Unique id.
    pub id: String,
    /// Owning task.
    pub task_id: String,
    /// Position in the chain (1-based).
    pub step_number: u32,
    /// Decision kind.
    pub decision_type: DecisionType,
    /// What was decided.
    pub description: String,
    /// Why this choice was made.
    pub reasoning: String,
    /// Supporting evidence.
    pub evidence: Vec<EvidenceNode>,
    /// Alternatives considered and rejected.
    pub alternatives: Vec<Value>,
    /// Confidence, 0.0 to 1.0.
    pub confidence: f64,
    /// Post-execution outcome, once known.
    pub outcome: Option<String>,
    /// When the decision was recorded.
    pub created_at: DateTime<Utc>,
}

/// Maintains the auditable decision trail for one task.
#[derive(Debug)]
pub struct EvidenceChain {
    task_id: String,
    decisions: Vec<DecisionRecord>,
}

impl EvidenceChain {
    /// Create an empty chain for a task.
    #[must_use]
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            decisions: Vec::new(),
        }
    }

    /// Record a decision with its evidence.
    pub fn record_decision(
        &mut self,
        decision_type: DecisionType,
        description: impl Into<String>,
        reasoning: impl Into<String>,
        evidence: Vec<EvidenceNode>,
        alternatives: Vec<Value>,
        confidence: f64,
    ) -> &DecisionRecord {
        let record = DecisionRecord {
            id: Uuid::new_v4().to_string(),
            task_id: self.task_id.clone(),
            step_number: u32::try_from(self.decisions.len()).unwrap_or(u32::MAX) + 1,
            decision_type,
            description: description.into(),
            reasoning: reasoning.into(),
            evidence,
            alternatives,
            confidence,
            outcome: None,
            created_at: Utc::now(),
        };
        debug!(
            kind = ?record.decision_type,
            description = %record.description,
            "decision recorded"
        );
        self.decisions.push(record);
        self.decisions.last().expect("just pushed")
    }

    /// Convenience recorder for tool-selection decisions.
    pub fn record_tool_decision(
        &mut self,
        tool_name: &str,
        args: &Value,
        reasoning: impl Into<String>,
    ) {
        let evidence = vec![
            EvidenceNode::new(
                EvidenceType::Heuristic,
                format!("Tool args: {args}"),
                "tool_registry",
            ),
        ];
        self.record_decision(
            DecisionType::ToolSelection,
            format!("Selected tool: {tool_name}"),
            reasoning,
            evidence,
            Vec::new(),
            0.5,
        );
    }

    /// Convenience recorder for tool results, feeding the verifier.
    pub fn record_tool_outcome(&mut self, tool_name: &str, result: &str, success: bool) {
        let evidence = vec![
            EvidenceNode::new(EvidenceType::ToolOutput, result, tool_name)
                .relevance(if success { 1.0 } else { 0.6 }),
        ];
        self.record_decision(
            DecisionType::ToolSelection,
            format!("Observed result of {tool_name}"),
            if success {
                "Tool executed successfully"
            } else {
                "Tool failed; result surfaced to the model"
            },
            evidence,
            Vec::new(),
            if success { 0.9 } else { 0.3 },
        );
    }

    /// Convenience recorder for plan and strategy decisions.
    pub fn record_plan_decision(
        &mut self,
        plan_summary: impl Into<String>,
        reasoning: impl Into<String>,
        confidence: f64,
    ) {
        self.record_decision(
            DecisionType::PlanChoice,
            plan_summary,
            reasoning,
            Vec::new(),
            Vec::new(),
            confidence,
        );
    }

    /// Backfill the outcome of a previously recorded decision.
    pub fn record_outcome(&mut self, decision_id: &str, outcome: impl Into<String>) {
        if let Some(decision) = self.decisions.iter_mut().find(|d| d.id == decision_id) {
            decision.outcome = Some(outcome.into());
        }
    }

    /// The decisions recorded so far, in order.
    #[must_use]
    pub fn decisions(&self) -> &[DecisionRecord] {
        &self.decisions
    }

    /// Number of recorded decisions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    /// Every tool-output evidence node for a given tool name.
    #[must_use]
    pub fn tool_outputs(&self, tool_name: &str) -> Vec<&EvidenceNode> {
        self.decisions
            .iter()
            .flat_map(|d| &d.evidence)
            .filter(|e| e.evidence_type == EvidenceType::ToolOutput && e.source == tool_name)
            .collect()
    }

    /// Names of all tools with recorded output evidence.
    #[must_use]
    pub fn observed_tools(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .decisions
            .iter()
            .flat_map(|d| &d.evidence)
            .filter(|e| e.evidence_type == EvidenceType::ToolOutput)
            .map(|e| e.source.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Generate a human-readable audit report of all decisions.
    #[must_use]
    pub fn audit_report(&self) -> String {
        let mut lines = vec![
            format!("# Evidence Chain — task {}", self.task_id),
            String::new(),
            format!("Total decisions: {}", self.decisions.len()),
            String::new(),
        ];

        for decision in &self.decisions {
            lines.push(format!(
                "## Decision {}: {}",
                decision.step_number, decision.description
            ));
            lines.push(format!(
                "Type: {} | Confidence: {:.0}%",
                serde_json::to_string(&decision.decision_type)
                    .unwrap_or_default()
                    .trim_matches('"'),
                decision.confidence * 100.0
            ));
            lines.push(format!("Reasoning: {}", decision.reasoning));
            if let Some(outcome) = &decision.outcome {
                lines.push(format!("Outcome: {outcome}"));
            }
            for node in &decision.evidence {
                lines.push(format!("- [{}] {}", node.source, node.content));
            }
            lines.push(String::new());
        }

        lines.join("\n")
    }
}
