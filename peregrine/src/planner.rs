//! Planner — turns a goal into an ordered step list and revises it mid-run.
//!
//! One LLM call produces the decomposition; any parse or provider failure
//! degrades to a single-step fallback plan built from the raw goal, so the
//! executor always has forward progress. Chat-embedded tasks skip the LLM
//! entirely and get the conversational single-step plan the executor's
//! shortcut keys on.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::plan::{Plan, Step, StepStatus};
use crate::provider::{ChatMessage, LlmProvider, LlmRequest};
use crate::tool::ToolDefinition;

/// Maximum steps in a generated plan.
const MAX_PLAN_STEPS: usize = 8;

/// Maximum characters per step description.
const MAX_STEP_CHARS: usize = 200;

/// Description of the conversational single-step plan. The executor's chat
/// shortcut matches on this prefix.
pub const CONVERSATIONAL_STEP: &str = "Respond to the user";

const PLANNING_PROMPT: &str = "\
You are a task planner. Decompose the goal into a short ordered list of \
concrete steps. Reply with a JSON array; each element is either a string \
(the step description) or an object {\"description\": ..., \"expected_tools\": [...]}. \
Keep descriptions under 200 characters. Use at most 8 steps. Do not \
include any text outside the JSON array.";

/// Creates and revises plans via one LLM call each.
pub struct Planner {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl Planner {
    /// Create a planner bound to a provider and model.
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// The single-step plan for chat-embedded tasks.
    #[must_use]
    pub fn conversational_plan(goal: &str) -> Plan {
        Plan::new(goal, vec![Step::new(0, CONVERSATIONAL_STEP)])
            .with_reasoning("Chat-embedded task; responding directly")
    }

    /// Whether a chat-embedded goal is simple conversation (greeting,
    /// small talk, a plain question) rather than work that needs tools.
    #[must_use]
    pub fn is_simple_conversational(goal: &str) -> bool {
        const TOOL_INTENT: [&str; 12] = [
            "file", "search", "fetch", "run", "execute", "create", "delete", "install", "deploy",
            "download", "write", "read",
        ];
        let lower = goal.to_lowercase();
        goal.split_whitespace().count() <= 25 && !TOOL_INTENT.iter().any(|kw| lower.contains(kw))
    }

    /// Decompose a goal into a plan. Never fails: planning errors produce
    /// the single-step fallback plan.
    pub async fn create_plan(&self, goal: &str, tools: &[ToolDefinition], context: &str) -> Plan {
        let tool_list: String = tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n");

        let user = format!(
            "Goal: {goal}\n\nAvailable tools:\n{tool_list}\n\nContext:\n{context}"
        );
        let request = LlmRequest::new(
            &self.model,
            vec![ChatMessage::system(PLANNING_PROMPT), ChatMessage::user(user)],
        )
        .temperature(0.3);

        let response = match self.provider.generate_with_tools(&request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "planning call failed, using single-step fallback");
                return Plan::fallback(goal, format!("Planning failed ({err})"));
            }
        };

        let Some(content) = response.content else {
            warn!("planner returned no content, using single-step fallback");
            return Plan::fallback(goal, "Planner returned an empty response");
        };

        match parse_steps(&content) {
            Some(descriptions) if !descriptions.is_empty() => {
                let steps: Vec<Step> = descriptions
                    .into_iter()
                    .take(MAX_PLAN_STEPS)
                    .enumerate()
                    .map(|(index, (description, expected))| {
                        Step::new(index, description).with_expected_tools(expected)
                    })
                    .collect();
                info!(steps = steps.len(), "plan created");
                Plan::new(goal, steps)
                    .with_reasoning(format!("Decomposed goal into steps from {} tools", tools.len()))
            }
            _ => {
                warn!("could not parse plan response, using single-step fallback");
                Plan::fallback(goal, "Plan response could not be parsed")
            }
        }
    }

    /// Replace every pending step with a freshly generated list, preserving
    /// terminal steps. On any failure the plan is returned unchanged except
    /// for the revision counter.
    pub async fn revise_plan(
        &self,
        mut plan: Plan,
        observations: &str,
        tools: &[ToolDefinition],
    ) -> Plan {
        plan.revision_count += 1;

        let remaining: Vec<&Step> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .collect();
        if remaining.is_empty() {
            return plan;
        }

        let pending_list: String = remaining
            .iter()
            .map(|s| format!("- {}", s.description))
            .collect::<Vec<_>>()
            .join("\n");

        let user = format!(
            "Goal: {goal}\n\nLatest observations:\n{observations}\n\n\
             Remaining planned steps:\n{pending_list}\n\n\
             Produce a replacement list for the remaining steps only.",
            goal = plan.goal,
        );
        let request = LlmRequest::new(
            &self.model,
            vec![ChatMessage::system(PLANNING_PROMPT), ChatMessage::user(user)],
        )
        .temperature(0.3);

        let revised = match self.provider.generate_with_tools(&request).await {
            Ok(response) => response.content.and_then(|c| parse_steps(&c)),
            Err(err) => {
                warn!(error = %err, "plan revision failed, keeping current plan");
                None
            }
        };

        let Some(descriptions) = revised.filter(|d| !d.is_empty()) else {
            return plan;
        };

        let mut steps: Vec<Step> = plan
            .steps
            .into_iter()
            .filter(|s| s.status != StepStatus::Pending)
            .collect();
        let base = steps.len();
        steps.extend(
            descriptions
                .into_iter()
                .take(MAX_PLAN_STEPS)
                .enumerate()
                .map(|(offset, (description, expected))| {
                    Step::new(base + offset, description).with_expected_tools(expected)
                }),
        );

        debug!(revision = plan.revision_count, steps = steps.len(), "plan revised");
        plan.steps = steps;
        plan
    }
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Parse a planner response into `(description, expected_tools)` pairs.
///
/// Accepts a JSON array (of strings or objects) or a numbered text list.
fn parse_steps(content: &str) -> Option<Vec<(String, Vec<String>)>> {
    let trimmed = content.trim();

    // JSON array, possibly wrapped in surrounding prose.
    let json_slice = trimmed
        .find('[')
        .and_then(|start| trimmed.rfind(']').map(|end| &trimmed[start..=end]));
    if let Some(slice) = json_slice
        && let Ok(Value::Array(items)) = serde_json::from_str::<Value>(slice)
    {
        let steps: Vec<(String, Vec<String>)> = items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some((clip(s), Vec::new())),
                Value::Object(map) => {
                    let description = map.get("description").and_then(Value::as_str)?;
                    let expected = map
                        .get("expected_tools")
                        .and_then(Value::as_array)
                        .map(|tools| {
                            tools
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_owned)
                                .collect()
                        })
                        .unwrap_or_default();
                    Some((clip(description), expected))
                }
                _ => None,
            })
            .collect();
        if !steps.is_empty() {
            return Some(steps);
        }
    }

    // Numbered list: "1. Do the thing" / "2) Next".
    let steps: Vec<(String, Vec<String>)> = trimmed
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line
                .split_once('.')
                .or_else(|| line.split_once(')'))
                .filter(|(n, _)| n.trim().parse::<u32>().is_ok())
                .map(|(_, rest)| rest.trim())?;
            (!rest.is_empty()).then(|| (clip(rest), Vec::new()))
        })
        .collect();

    (!steps.is_empty()).then_some(steps)
}

fn clip(text: &str) -> String {
    text.chars().take(MAX_STEP_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{MockProvider, ScriptedTurn};

    fn tools() -> Vec<ToolDefinition> {
        vec![ToolDefinition::new(
            "fetch_url",
            "Fetch a URL",
            serde_json::json!({}),
        )]
    }

    #[tokio::test]
    async fn parses_json_array_plan() {
        let provider = Arc::new(MockProvider::new(
            "mock",
            vec![ScriptedTurn::Text(
                r#"["Fetch the page", {"description": "Summarize it", "expected_tools": ["fetch_url"]}]"#
                    .to_owned(),
            )],
        ));
        let planner = Planner::new(provider, "m");

        let plan = planner.create_plan("summarize example.com", &tools(), "").await;
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].description, "Fetch the page");
        assert_eq!(plan.steps[1].expected_tools, vec!["fetch_url"]);
    }

    #[tokio::test]
    async fn parses_numbered_list_plan() {
        let provider = Arc::new(MockProvider::new(
            "mock",
            vec![ScriptedTurn::Text(
                "Here is the plan:\n1. Gather inputs\n2. Produce the report".to_owned(),
            )],
        ));
        let planner = Planner::new(provider, "m");

        let plan = planner.create_plan("report", &tools(), "").await;
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].description, "Produce the report");
    }

    #[tokio::test]
    async fn provider_failure_yields_fallback() {
        let provider = Arc::new(MockProvider::new(
            "mock",
            vec![ScriptedTurn::Error("boom".to_owned())],
        ));
        let planner = Planner::new(provider, "m");

        let plan = planner.create_plan("do the thing", &tools(), "").await;
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.steps[0].description.contains("do the thing"));
        assert!(plan.reasoning.contains("Planning failed"));
    }

    #[tokio::test]
    async fn unparseable_response_yields_fallback() {
        let provider = Arc::new(MockProvider::new(
            "mock",
            vec![ScriptedTurn::Text("I cannot plan this.".to_owned())],
        ));
        let planner = Planner::new(provider, "m");

        let plan = planner.create_plan("goal", &tools(), "").await;
        assert_eq!(plan.steps.len(), 1);
    }

    #[tokio::test]
    async fn revision_preserves_terminal_steps() {
        let provider = Arc::new(MockProvider::new(
            "mock",
            vec![ScriptedTurn::Text(r#"["New second step"]"#.to_owned())],
        ));
        let planner = Planner::new(provider, "m");

        let mut plan = Plan::new("g", vec![Step::new(0, "done step"), Step::new(1, "old step")]);
        plan.steps[0].begin().unwrap();
        plan.steps[0].complete("ok").unwrap();

        let revised = planner.revise_plan(plan, "observed things", &tools()).await;
        assert_eq!(revised.revision_count, 1);
        assert_eq!(revised.steps.len(), 2);
        assert_eq!(revised.steps[0].description, "done step");
        assert_eq!(revised.steps[1].description, "New second step");
        assert_eq!(revised.steps[1].index, 1);
    }

    #[test]
    fn conversational_plan_shape() {
        let plan = Planner::conversational_plan("hi there");
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.steps[0].description.starts_with(CONVERSATIONAL_STEP));
    }

    #[test]
    fn conversational_classification() {
        assert!(Planner::is_simple_conversational("Echo hello back to me"));
        assert!(Planner::is_simple_conversational("how are you today?"));
        assert!(!Planner::is_simple_conversational(
            "search the web for rust release notes"
        ));
        assert!(!Planner::is_simple_conversational(
            "delete the old build artifacts"
        ));
    }
}
