//! One reasoning turn: prompt, route, call the model, interpret.

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::TaskEventKind;
use crate::plan::Step;
use crate::provider::{CLOUD_PRIORITY, LlmRequest, LlmResponse};
use crate::router::ModelRoute;
use crate::tool::ToolDefinition;

use super::compact::{compact_messages, needs_escalation};
use super::prompt::build_messages;
use super::selector::ToolSelector;
use super::{Executor, RunCtx, clip};

/// Phrases that mark a text-only autonomous turn as step completion.
const COMPLETION_PHRASES: [&str; 4] = [
    "step is complete",
    "this step is done",
    "completed this step",
    "no tools needed",
];

impl Executor {
    /// Run one iteration of the reason/act loop for the step at
    /// `step_index`. Mutates the step's status; the outer loop reacts.
    pub(crate) async fn turn(&mut self, ctx: &mut RunCtx, step_index: usize) -> Result<()> {
        let step = ctx.task.plan.as_ref().expect("plan").steps[step_index].clone();
        let tracker = ctx.diagnostics.entry(step.id.clone()).or_default();
        let mut messages = build_messages(&ctx.task, &step, tracker);

        // ── Conversational shortcut ──────────────────────────────────
        // First attempt of a pre-classified chat step: answer directly
        // with an empty tool set instead of offering the full catalog.
        let conversational = ctx.task.is_chat_embedded()
            && step.tool_calls.is_empty()
            && step
                .description
                .starts_with(crate::planner::CONVERSATIONAL_STEP);

        let expected: &[String] = if conversational {
            &[]
        } else {
            &step.expected_tools
        };
        let route = self
            .router
            .select(&step.description, expected, ctx.task.messages.len());

        let tools = if conversational {
            Vec::new()
        } else {
            ToolSelector::select(
                &self.tools,
                &step.description,
                &step.expected_tools,
                route.is_local(),
            )
        };

        let mut provider = self.resolve_provider(&route.provider);
        let mut model = if route.model.is_empty() {
            self.model.clone()
        } else {
            route.model.clone()
        };

        // If the routed provider is not ready, try the hosted chain.
        if !provider.is_ready() {
            for name in CLOUD_PRIORITY {
                if let Some(cloud) = self.providers.get(name).filter(|p| p.is_ready()) {
                    info!(from = %route.provider, to = name, "routed provider not ready, using cloud");
                    provider = cloud;
                    model = String::new();
                    break;
                }
            }
        }

        // ── Context compaction (+ escalation on overflow) ────────────
        let was_compacted = compact_messages(&mut messages, provider.context_window());
        if was_compacted && needs_escalation(&messages, provider.context_window()) {
            for name in CLOUD_PRIORITY {
                if let Some(cloud) = self.providers.get(name).filter(|p| p.is_ready()) {
                    if cloud.context_window() > provider.context_window() {
                        info!(from = %provider.name(), to = name, "context overflow, escalating");
                        provider = cloud;
                        model = String::new();
                        break;
                    }
                }
            }
        }

        ctx.sink
            .emit(
                ctx.event(TaskEventKind::RoutingInfo)
                    .step(&step.id)
                    .content(routing_payload(provider.name(), &model, &route, false)),
            )
            .await;

        // ── Call the model, with cloud failover for local backends ───
        let request = LlmRequest::new(&model, messages.clone())
            .tools(tools)
            .temperature(route.temperature)
            .max_tokens(route.max_tokens);

        let first_try = match provider.generate_with_tools(&request).await {
            // Some backends report failures as content instead of errors.
            Ok(response)
                if response.tool_calls.is_empty()
                    && response
                        .content
                        .as_deref()
                        .is_some_and(|c| c.starts_with("[Error:")) =>
            {
                Err(crate::error::Error::provider(
                    provider.name(),
                    response.content.unwrap_or_default(),
                ))
            }
            other => other,
        };

        let response = match first_try {
            Ok(response) => response,
            Err(err) if provider.is_local() => {
                match self.cloud_failover(ctx, &step, &route, &messages).await {
                    Some(response) => response,
                    None => {
                        warn!(error = %err, "all providers failed for step");
                        let plan = ctx.task.plan.as_mut().expect("plan");
                        plan.steps[step_index]
                            .fail(format!("All providers failed: {}", clip(&err.to_string(), 300)))?;
                        self.store.update_task(&ctx.task).await?;
                        return Ok(());
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, provider = %provider.name(), "LLM call failed");
                let plan = ctx.task.plan.as_mut().expect("plan");
                plan.steps[step_index]
                    .fail(format!("LLM API error: {}", clip(&err.to_string(), 300)))?;
                self.store.update_task(&ctx.task).await?;
                return Ok(());
            }
        };

        if let Some(usage) = response.usage {
            ctx.task.add_token_usage(usage.total());
            ctx.metrics.record_llm_call(usage);
            ctx.sink
                .emit(
                    ctx.event(TaskEventKind::MetricsUpdate)
                        .content(ctx.metrics.to_event_payload()),
                )
                .await;
        }

        // ── Interpret the response ───────────────────────────────────
        if !response.tool_calls.is_empty() {
            // Keep any accompanying text so the step has a meaningful
            // result even without an explicit task_complete.
            if let Some(content) = response.content.as_deref().filter(|c| !c.trim().is_empty()) {
                let step_mut = &mut ctx.task.plan.as_mut().expect("plan").steps[step_index];
                if step_mut.result.is_none() {
                    step_mut.result = Some(content.to_owned());
                }
            }
            self.dispatch_tool_calls(ctx, step_index, response.tool_calls)
                .await?;
            return Ok(());
        }

        if let Some(text) = response.content.filter(|t| !t.trim().is_empty()) {
            if ctx.task.is_chat_embedded() {
                let plan = ctx.task.plan.as_mut().expect("plan");
                plan.steps[step_index].complete(text)?;
                self.store.update_task(&ctx.task).await?;
                return Ok(());
            }

            ctx.sink
                .emit(
                    ctx.event(TaskEventKind::Thinking)
                        .step(&step.id)
                        .content(&text),
                )
                .await;

            let lower = text.to_lowercase();
            if COMPLETION_PHRASES.iter().any(|p| lower.contains(p)) {
                let plan = ctx.task.plan.as_mut().expect("plan");
                plan.steps[step_index].complete(text)?;
            }
            self.store.update_task(&ctx.task).await?;
            return Ok(());
        }

        // Neither tool calls nor text.
        debug!(step = %step.description, "model returned an empty response");
        let plan = ctx.task.plan.as_mut().expect("plan");
        plan.steps[step_index].fail(
            "LLM returned an empty response (no content and no tool calls). This usually \
             means the API rejected the request or the model is unavailable.",
        )?;
        self.store.update_task(&ctx.task).await?;
        Ok(())
    }

    /// Try each ready hosted provider in priority order with the same
    /// messages and a cloud-sized tool set. `None` when every provider
    /// fails or none is ready.
    async fn cloud_failover(
        &mut self,
        ctx: &mut RunCtx,
        step: &Step,
        route: &ModelRoute,
        messages: &[crate::provider::ChatMessage],
    ) -> Option<LlmResponse> {
        for name in CLOUD_PRIORITY {
            let Some(cloud) = self.providers.get(name).filter(|p| p.is_ready()) else {
                continue;
            };

            let cloud_tools: Vec<ToolDefinition> = ToolSelector::select(
                &self.tools,
                &step.description,
                &step.expected_tools,
                false,
            );

            info!(from = %route.provider, to = name, tools = cloud_tools.len(), "cloud failover");
            ctx.sink
                .emit(
                    ctx.event(TaskEventKind::RoutingInfo)
                        .step(&step.id)
                        .content(routing_payload(name, "", route, true)),
                )
                .await;

            let request = LlmRequest::new("", messages.to_vec())
                .tools(cloud_tools)
                .temperature(route.temperature)
                .max_tokens(route.max_tokens.max(8192));

            match cloud.generate_with_tools(&request).await {
                Ok(response) => return Some(response),
                Err(err) => {
                    warn!(provider = name, error = %err, "cloud failover attempt failed");
                }
            }
        }
        None
    }
}

fn routing_payload(provider: &str, model: &str, route: &ModelRoute, escalated: bool) -> String {
    serde_json::json!({
        "provider": provider,
        "model": model,
        "step_kind": route.step_kind.as_str(),
        "escalated": escalated,
        "reason": route.reason,
    })
    .to_string()
}
