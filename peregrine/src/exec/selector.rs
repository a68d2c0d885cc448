//! Tool selection — a relevant subset of the catalog per step.
//!
//! Small local models degrade sharply when handed dozens of tool schemas,
//! so each step gets a scored subset: expected tools first, then keyword
//! matches on name/description/category, capped per provider class.
//! Control tools are always included.

use std::collections::HashSet;

use crate::tool::registry::ToolRegistry;
use crate::tool::{ToolDefinition, is_control_tool};

/// Tool cap for local providers.
const LOCAL_TOOL_CAP: usize = 8;

/// Tool cap for hosted providers.
const CLOUD_TOOL_CAP: usize = 24;

/// Picks the subset of tools offered to the model for one step.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolSelector;

impl ToolSelector {
    /// Select tool definitions for a step.
    ///
    /// The result always contains the control tools; expected tools are
    /// forced in; everything else competes on keyword relevance up to the
    /// provider-class cap. Falls back to the full catalog when scoring
    /// selects nothing beyond the controls.
    #[must_use]
    pub fn select(
        registry: &ToolRegistry,
        step_description: &str,
        expected_tools: &[String],
        local_provider: bool,
    ) -> Vec<ToolDefinition> {
        let cap = if local_provider {
            LOCAL_TOOL_CAP
        } else {
            CLOUD_TOOL_CAP
        };

        let description = step_description.to_lowercase();
        let words: HashSet<&str> = description
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| w.len() > 2)
            .collect();

        let mut selected: Vec<ToolDefinition> = Vec::new();
        let mut chosen: HashSet<String> = HashSet::new();

        for spec in registry.specs() {
            let name = spec.name();
            if is_control_tool(name) || expected_tools.iter().any(|t| t == name) {
                chosen.insert(name.to_owned());
                selected.push(spec.definition.clone());
            }
        }

        let mut scored: Vec<(usize, ToolDefinition)> = registry
            .specs()
            .into_iter()
            .filter(|spec| !chosen.contains(spec.name()))
            .filter_map(|spec| {
                let score = relevance(&words, spec.name(), &spec.definition.description, &spec.category);
                (score > 0).then(|| (score, spec.definition.clone()))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));

        for (_, definition) in scored {
            if selected.len() >= cap {
                break;
            }
            selected.push(definition);
        }

        // Nothing matched beyond the controls: offer the whole catalog
        // (clipped to the cap) rather than starving the model.
        if selected.iter().all(|d| is_control_tool(&d.name)) {
            let mut all = registry.definitions();
            all.sort_by(|a, b| a.name.cmp(&b.name));
            for definition in all {
                if selected.len() >= cap {
                    break;
                }
                if !selected.iter().any(|d| d.name == definition.name) {
                    selected.push(definition);
                }
            }
        }

        selected
    }
}

fn relevance(words: &HashSet<&str>, name: &str, description: &str, category: &str) -> usize {
    let mut score = 0;
    for part in name.split('_') {
        if words.contains(part) {
            score += 3;
        }
    }
    if words.contains(category) {
        score += 2;
    }
    let description = description.to_lowercase();
    score += description
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && words.contains(w))
        .count();
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::tool::{ToolContext, ToolHandler, ToolSpec};
    use serde_json::Value;
    use std::sync::Arc;

    struct NoopHandler;

    #[async_trait::async_trait]
    impl ToolHandler for NoopHandler {
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            Ok(Value::Null)
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for (name, description, category) in [
            ("fetch_url", "Fetch a web page by URL", "web"),
            ("read_file", "Read a file from disk", "filesystem"),
            ("write_file", "Write a file to disk", "filesystem"),
            ("search_web", "Search the web", "web"),
        ] {
            registry.register(ToolSpec::new(
                ToolDefinition::new(name, description, serde_json::json!({})),
                Arc::new(NoopHandler),
            ).category(category));
        }
        registry
    }

    #[test]
    fn control_tools_always_present() {
        let registry = registry();
        let tools = ToolSelector::select(&registry, "anything at all", &[], true);
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"task_complete"));
        assert!(names.contains(&"ask_human"));
    }

    #[test]
    fn expected_tools_are_forced_in() {
        let registry = registry();
        let tools = ToolSelector::select(
            &registry,
            "no keyword overlap here",
            &["write_file".to_owned()],
            true,
        );
        assert!(tools.iter().any(|t| t.name == "write_file"));
    }

    #[test]
    fn relevant_tools_rank_in() {
        let registry = registry();
        let tools = ToolSelector::select(&registry, "fetch the url of the page", &[], true);
        assert!(tools.iter().any(|t| t.name == "fetch_url"));
    }

    #[test]
    fn no_match_falls_back_to_catalog() {
        let registry = registry();
        let tools = ToolSelector::select(&registry, "zzz qqq", &[], false);
        // Full catalog (4 tools + 2 controls) fits under the cloud cap.
        assert_eq!(tools.len(), 6);
    }
}
