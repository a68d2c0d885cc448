//! Executor — the ReAct loop that drives a task to completion.
//!
//! One [`Executor`] drives one task: plan, then loop reason → act → observe
//! until the plan is complete, a budget is exhausted, or the task is
//! cancelled. The executor is the single writer of task state; everything
//! observable leaves through the [`EventSink`] and the persistence adapter.
//!
//! The loop structure follows the phases:
//!
//! 1. Context enrichment (optional learner / memory-graph hooks)
//! 2. Planning (with single-step fallback)
//! 3. The execution loop: budget checks, step selection, one reasoning
//!    turn per iteration, retry of failed steps, periodic plan revision
//! 4. Completion: result synthesis, evidence persistence, post-task hooks

mod dispatch;
mod turn;

pub mod compact;
pub mod diagnostics;
pub mod prompt;
pub mod selector;
pub mod verifier;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, info_span, warn};
use tracing::Instrument as _;

use crate::approval::ApprovalStatus;
use crate::checkpoint::CheckpointManager;
use crate::error::{Error, Result};
use crate::event::{EventSink, Progress, TaskEvent, TaskEventKind};
use crate::evidence::EvidenceChain;
use crate::guardrails::Guardrails;
use crate::hooks::{Learner, MemoryGraph, goal_query_terms};
use crate::metrics::MetricsCollector;
use crate::plan::{Plan, StepStatus};
use crate::planner::Planner;
use crate::provider::{LlmProvider, ProviderRegistry};
use crate::router::{ModelRouter, RouterConfig};
use crate::store::TaskStore;
use crate::task::{Task, TaskStatus};
use crate::tool::registry::ToolRegistry;

use diagnostics::DiagnosticTracker;
use verifier::Verifier;

/// Maximum concurrent tool dispatches per task.
pub const MAX_PARALLEL_TOOLS: usize = 5;

/// Wait window for `ask_human` approvals.
pub const APPROVAL_WAIT_CHAT: Duration = Duration::from_secs(1800);

/// Wait window for inline risky-tool approvals.
pub const APPROVAL_WAIT_TOOL: Duration = Duration::from_secs(300);

/// Poll interval while waiting on an approval.
const APPROVAL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Plan revision is considered every this many iterations.
const REFLECTION_INTERVAL: u32 = 5;

/// Per-run mutable state threaded through the loop.
pub(crate) struct RunCtx {
    pub task: Task,
    pub sink: EventSink,
    pub cancel: watch::Receiver<bool>,
    pub started: tokio::time::Instant,
    pub evidence: EvidenceChain,
    pub checkpoints: CheckpointManager,
    pub metrics: MetricsCollector,
    pub diagnostics: HashMap<String, DiagnosticTracker>,
}

impl RunCtx {
    fn new(task: Task, sink: EventSink, cancel: watch::Receiver<bool>) -> Self {
        let evidence = EvidenceChain::new(&task.id);
        Self {
            task,
            sink,
            cancel,
            started: tokio::time::Instant::now(),
            evidence,
            checkpoints: CheckpointManager::new(),
            metrics: MetricsCollector::new(),
            diagnostics: HashMap::new(),
        }
    }

    pub(crate) fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn event(&self, kind: TaskEventKind) -> TaskEvent {
        TaskEvent::new(kind, &self.task.id, progress_of(&self.task))
    }

    pub(crate) fn tracker(&mut self, step_id: &str) -> &mut DiagnosticTracker {
        self.diagnostics.entry(step_id.to_owned()).or_default()
    }
}

/// Progress snapshot of a task.
pub(crate) fn progress_of(task: &Task) -> Progress {
    let (done, total) = task.plan.as_ref().map_or((0, 0), Plan::progress);
    Progress {
        current_step: done,
        total_steps: total,
        iterations: task.iterations,
        tokens_used: task.token_usage,
        tool_calls: task.tool_calls_count,
    }
}

/// Drives one task through the plan/act/observe/reflect loop.
pub struct Executor {
    pub(crate) providers: ProviderRegistry,
    pub(crate) default_provider: String,
    pub(crate) model: String,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) guardrails: Guardrails,
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) router: ModelRouter,
    pub(crate) planner: Planner,
    pub(crate) verifier: Option<Arc<dyn Verifier>>,
    pub(crate) learner: Option<Arc<dyn Learner>>,
    pub(crate) memory_graph: Option<Arc<dyn MemoryGraph>>,
}

impl Executor {
    /// Create an executor.
    ///
    /// `default_provider` names the workspace's configured provider in
    /// `providers`; it backs the planner and any call the router leaves
    /// unrouted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when `default_provider` is not
    /// registered.
    pub fn new(
        providers: ProviderRegistry,
        default_provider: impl Into<String>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn TaskStore>,
    ) -> Result<Self> {
        let default_provider = default_provider.into();
        let model = model.into();
        let base = providers.get(&default_provider).ok_or_else(|| {
            Error::configuration(format!("provider '{default_provider}' is not registered"))
        })?;
        let router = ModelRouter::new(RouterConfig::default(), Arc::new(providers.clone()));
        let planner = Planner::new(base, &model);

        Ok(Self {
            providers,
            default_provider,
            model,
            tools,
            guardrails: Guardrails::new(),
            store,
            router,
            planner,
            verifier: None,
            learner: None,
            memory_graph: None,
        })
    }

    /// Replace the router configuration.
    #[must_use]
    pub fn with_router_config(mut self, config: RouterConfig) -> Self {
        self.router = ModelRouter::new(config, Arc::new(self.providers.clone()));
        self
    }

    /// Gate `task_complete` behind a verifier.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Attach a cross-task learner hook.
    #[must_use]
    pub fn with_learner(mut self, learner: Arc<dyn Learner>) -> Self {
        self.learner = Some(learner);
        self
    }

    /// Attach a memory-graph hook.
    #[must_use]
    pub fn with_memory_graph(mut self, memory_graph: Arc<dyn MemoryGraph>) -> Self {
        self.memory_graph = Some(memory_graph);
        self
    }

    /// Run a task to a terminal state, emitting events through `sink`.
    ///
    /// Cancellation is observed through `cancel` at every suspension point;
    /// in-flight tool dispatches finish but their results are not fed back.
    /// Returns the task in its final state.
    pub async fn run(
        mut self,
        task: Task,
        sink: EventSink,
        cancel: watch::Receiver<bool>,
    ) -> Task {
        let span = info_span!("task", task.id = %task.id, task.goal = %task.goal);
        let mut ctx = RunCtx::new(task, sink, cancel);

        let outcome = self.run_inner(&mut ctx).instrument(span).await;
        match outcome {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                // An approval left pending by the unwind is expired so the
                // stream still sees exactly one resolution for it.
                if let Some(approval) = ctx.task.pending_approval.take() {
                    let _ = self
                        .store
                        .resolve_approval(&approval.id, ApprovalStatus::Expired, "system")
                        .await;
                }
                if ctx.task.cancel().is_ok() {
                    let _ = self.store.update_task(&ctx.task).await;
                }
                ctx.sink
                    .emit(ctx.event(TaskEventKind::TaskPaused).content("Task cancelled"))
                    .await;
                info!(task_id = %ctx.task.id, "task cancelled");
            }
            Err(err) => {
                let message = err.to_string();
                if !ctx.task.status.is_terminal() {
                    let _ = ctx.task.fail(&message);
                    let _ = self.store.update_task(&ctx.task).await;
                }
                ctx.sink
                    .emit(ctx.event(TaskEventKind::TaskFailed).content(&message))
                    .await;
                warn!(task_id = %ctx.task.id, error = %message, "task failed");
            }
        }
        ctx.task
    }

    async fn run_inner(&mut self, ctx: &mut RunCtx) -> Result<()> {
        let enrichment = self.enrich_context(ctx).await;

        // ── Phase 1: planning ────────────────────────────────────────
        if ctx.task.status == TaskStatus::Planning {
            let plan = if ctx.task.is_chat_embedded()
                && Planner::is_simple_conversational(&ctx.task.goal)
            {
                Planner::conversational_plan(&ctx.task.goal)
            } else {
                self.planner
                    .create_plan(&ctx.task.goal, &self.tools.definitions(), &enrichment)
                    .await
            };

            ctx.evidence.record_plan_decision(
                format!(
                    "Created {}-step plan for: {}",
                    plan.steps.len(),
                    clip(&ctx.task.goal, 100)
                ),
                format!(
                    "Decomposed goal into {} steps based on available tools",
                    plan.steps.len()
                ),
                0.7,
            );

            let plan_json = serde_json::to_string(&plan)?;
            ctx.task.plan = Some(plan);
            self.store.update_task(&ctx.task).await?;
            ctx.sink
                .emit(ctx.event(TaskEventKind::PlanCreated).content(plan_json))
                .await;
        } else if ctx.task.plan.is_none() {
            ctx.task.plan = Some(Plan::fallback(&ctx.task.goal, "No plan on resume"));
        }

        ctx.task.begin_execution()?;
        self.store.update_task(&ctx.task).await?;

        // ── Phase 2: execution loop ──────────────────────────────────
        loop {
            if ctx.cancelled() {
                return Err(Error::Cancelled);
            }
            if ctx.task.plan.as_ref().is_none_or(Plan::is_complete) {
                break;
            }

            ctx.task.record_iteration();

            if let Some(budget_error) = self.guardrails.check_budget(&ctx.task, ctx.elapsed()) {
                preserve_partial_result(&mut ctx.task);
                ctx.task.fail(&budget_error)?;
                self.store.update_task(&ctx.task).await?;
                ctx.sink
                    .emit(ctx.event(TaskEventKind::TaskFailed).content(&budget_error))
                    .await;
                return Ok(());
            }

            let Some(step_index) = ctx.task.plan.as_ref().and_then(Plan::current_step_index)
            else {
                break;
            };

            // Start the step if this is its first iteration.
            let started_event = {
                let plan = ctx.task.plan.as_mut().expect("plan checked above");
                let step = &mut plan.steps[step_index];
                if step.status == StepStatus::Pending {
                    step.begin()?;
                    Some((step.id.clone(), step.description.clone()))
                } else {
                    None
                }
            };
            if let Some((step_id, description)) = started_event {
                self.store.update_task(&ctx.task).await?;
                ctx.sink
                    .emit(
                        ctx.event(TaskEventKind::StepStarted)
                            .step(step_id)
                            .content(description),
                    )
                    .await;
            }

            // One reasoning turn.
            self.turn(ctx, step_index).await?;

            // React to the step's new status.
            let (status, step_id, result, error, can_retry, description) = {
                let step = &ctx.task.plan.as_ref().expect("plan").steps[step_index];
                (
                    step.status,
                    step.id.clone(),
                    step.result.clone(),
                    step.error.clone(),
                    step.can_retry(),
                    step.description.clone(),
                )
            };

            match status {
                StepStatus::Complete => {
                    ctx.sink
                        .emit(
                            ctx.event(TaskEventKind::StepComplete)
                                .step(&step_id)
                                .content(result.clone().unwrap_or_default()),
                        )
                        .await;
                }
                StepStatus::Failed => {
                    if can_retry {
                        let plan = ctx.task.plan.as_mut().expect("plan");
                        plan.steps[step_index].retry()?;
                        self.store.update_task(&ctx.task).await?;
                        info!(step_id = %step_id, "retrying failed step");
                        continue;
                    }
                    let message = format!(
                        "Step '{description}' failed: {}",
                        error.unwrap_or_else(|| "no error recorded".to_owned())
                    );
                    preserve_partial_result(&mut ctx.task);
                    ctx.task.fail(&message)?;
                    self.store.update_task(&ctx.task).await?;
                    ctx.sink
                        .emit(
                            ctx.event(TaskEventKind::TaskFailed)
                                .step(&step_id)
                                .content(&message),
                        )
                        .await;
                    return Ok(());
                }
                StepStatus::Pending | StepStatus::InProgress | StepStatus::Skipped => {}
            }

            // ── Reflect: revise the plan periodically ────────────────
            let should_reflect = status == StepStatus::Complete
                && !ctx.task.is_chat_embedded()
                && ctx.task.iterations % REFLECTION_INTERVAL == 0
                && self.guardrails.check_budget(&ctx.task, ctx.elapsed()).is_none()
                && ctx
                    .task
                    .plan
                    .as_ref()
                    .is_some_and(|p| p.revision_count < Plan::MAX_REVISIONS && !p.is_complete());
            if should_reflect {
                ctx.task.transition(TaskStatus::Reflecting)?;
                self.store.update_task(&ctx.task).await?;

                let plan = ctx.task.plan.take().expect("plan");
                let observations = result.unwrap_or_default();
                let revised = self
                    .planner
                    .revise_plan(plan, &observations, &self.tools.definitions())
                    .await;
                ctx.evidence.record_plan_decision(
                    format!("Revised plan (revision {})", revised.revision_count),
                    "Periodic reflection against latest observations",
                    0.6,
                );
                ctx.task.plan = Some(revised);
                ctx.task.transition(TaskStatus::Executing)?;
                self.store.update_task(&ctx.task).await?;
            }
        }

        // ── Phase 3: completion ──────────────────────────────────────
        // A plan whose last step was cut off by a budget still fails the
        // task; partial results stay on the steps.
        if let Some(budget_error) = self.guardrails.check_budget(&ctx.task, ctx.elapsed()) {
            preserve_partial_result(&mut ctx.task);
            ctx.task.fail(&budget_error)?;
            self.store.update_task(&ctx.task).await?;
            ctx.sink
                .emit(ctx.event(TaskEventKind::TaskFailed).content(&budget_error))
                .await;
            return Ok(());
        }

        let result = ctx.task.synthesize_result();
        ctx.task.complete(&result)?;
        self.store.update_task(&ctx.task).await?;

        ctx.sink
            .emit(
                ctx.event(TaskEventKind::MetricsUpdate)
                    .content(ctx.metrics.to_event_payload()),
            )
            .await;
        ctx.sink
            .emit(ctx.event(TaskEventKind::TaskComplete).content(&result))
            .await;

        if let Err(err) = self
            .store
            .save_evidence(&ctx.task.id, ctx.evidence.decisions())
            .await
        {
            warn!(error = %err, "evidence persistence failed");
        }
        ctx.checkpoints.clear();

        self.post_task_hooks(ctx, &result).await;
        info!(task_id = %ctx.task.id, iterations = ctx.task.iterations, "task complete");
        Ok(())
    }

    /// Phase 0: gather lesson and memory-graph context. Failures are
    /// logged, never fatal.
    async fn enrich_context(&self, ctx: &RunCtx) -> String {
        let mut parts = vec![format!("Workspace: {}", ctx.task.workspace_id)];
        if let Some(conversation_id) = &ctx.task.conversation_id {
            parts.push(format!("Conversation: {conversation_id}"));
        }

        if let Some(learner) = &self.learner {
            match learner
                .enrich_context(&ctx.task.workspace_id, &ctx.task.goal)
                .await
            {
                Ok(block) if !block.is_empty() => parts.push(block),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "lesson enrichment failed"),
            }
        }

        if let Some(graph) = &self.memory_graph {
            let terms = goal_query_terms(&ctx.task.goal);
            match graph.context_block(&ctx.task.workspace_id, &terms).await {
                Ok(block) if !block.is_empty() => parts.push(block),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "memory graph query failed"),
            }
        }

        parts.join("\n\n")
    }

    /// Phases 4 and 5: memory-graph extraction and lesson learning.
    async fn post_task_hooks(&self, ctx: &RunCtx, result: &str) {
        if let Some(graph) = &self.memory_graph {
            let conversation = ctx
                .task
                .conversation_id
                .clone()
                .unwrap_or_else(|| ctx.task.id.clone());
            if let Err(err) = graph
                .store_extraction(&conversation, &ctx.task.workspace_id, &ctx.task.goal, result)
                .await
            {
                warn!(error = %err, "memory graph update failed");
            }
        }

        if let Some(learner) = &self.learner {
            if let Err(err) = learner.extract_lessons(&ctx.task).await {
                warn!(error = %err, "post-task learning failed");
            }
        }
    }

    /// Resolve the provider for a route, falling back to the workspace
    /// default when the routed provider is unknown.
    pub(crate) fn resolve_provider(&self, provider_name: &str) -> Arc<dyn LlmProvider> {
        self.providers
            .get(provider_name)
            .or_else(|| self.providers.get(&self.default_provider))
            .expect("default provider validated at construction")
    }
}

/// Keep whatever step results were gathered before a failure as the task's
/// result text.
fn preserve_partial_result(task: &mut Task) {
    let has_partial = task
        .plan
        .as_ref()
        .is_some_and(|p| p.steps.iter().any(|s| s.result.is_some()));
    if has_partial && task.result.is_none() {
        task.result = Some(task.synthesize_result());
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("default_provider", &self.default_provider)
            .field("model", &self.model)
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

pub(crate) fn clip(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
