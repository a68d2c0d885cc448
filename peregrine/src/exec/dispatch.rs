//! Tool dispatch: approval gating, retry with event emission, parallel
//! batches, and the control tools.
//!
//! Every dispatch attempt emits exactly one `tool_called` followed by one
//! `tool_result` and bumps the task's tool-call counter; retries are
//! therefore externally visible. A parallel batch runs under a semaphore of
//! [`MAX_PARALLEL_TOOLS`](super::MAX_PARALLEL_TOOLS); after every result
//! the budget is re-checked, and on exhaustion the step ends with a
//! `Stopped:` result while in-flight calls drain into the step history.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::approval::{ApprovalRequest, ApprovalStatus};
use crate::error::{Error, Result, StoreError};
use crate::event::{EventSink, Progress, TaskEvent, TaskEventKind};
use crate::plan::ToolCallRecord;
use crate::provider::ToolCallRequest;
use crate::task::TaskStatus;
use crate::tool::registry::{RETRY_MAX_ATTEMPTS, ToolRegistry, is_transient_error, retry_delay};
use crate::tool::{ASK_HUMAN, TASK_COMPLETE, ToolContext, ToolResult, is_control_tool};

use super::{
    APPROVAL_POLL_INTERVAL, APPROVAL_WAIT_CHAT, APPROVAL_WAIT_TOOL, Executor, MAX_PARALLEL_TOOLS,
    RunCtx, clip, progress_of,
};

impl Executor {
    /// Dispatch a model turn's tool calls: a parallel batch for the
    /// independent low-risk ones, then the sequential queue (controls and
    /// approval-gated calls) in order.
    pub(crate) async fn dispatch_tool_calls(
        &mut self,
        ctx: &mut RunCtx,
        step_index: usize,
        calls: Vec<ToolCallRequest>,
    ) -> Result<()> {
        let mut parallel = Vec::new();
        let mut sequential = Vec::new();

        for call in calls {
            let gated = is_control_tool(&call.name)
                || self
                    .guardrails
                    .needs_approval(&call.name, &call.arguments, &ctx.task.config, &self.tools)
                    .is_some();
            if gated {
                sequential.push(call);
            } else {
                parallel.push(call);
            }
        }

        if parallel.len() > 1 {
            self.dispatch_parallel(ctx, step_index, parallel).await?;
        } else {
            // A lone parallel-safe call just runs first in the queue.
            sequential.splice(0..0, parallel);
        }

        for call in sequential {
            if self.step_terminal(ctx, step_index) {
                break;
            }
            self.dispatch_sequential(ctx, step_index, call).await?;
        }

        self.store.update_task(&ctx.task).await?;
        Ok(())
    }

    fn step_terminal(&self, ctx: &RunCtx, step_index: usize) -> bool {
        ctx.task.plan.as_ref().expect("plan").steps[step_index]
            .status
            .is_terminal()
    }

    /// One sequential dispatch with guardrail gating and control-tool
    /// handling.
    async fn dispatch_sequential(
        &mut self,
        ctx: &mut RunCtx,
        step_index: usize,
        call: ToolCallRequest,
    ) -> Result<()> {
        let (step_id, description) = {
            let step = &ctx.task.plan.as_ref().expect("plan").steps[step_index];
            (step.id.clone(), step.description.clone())
        };

        if !is_control_tool(&call.name) {
            if let Some(reason) = self.guardrails.needs_approval(
                &call.name,
                &call.arguments,
                &ctx.task.config,
                &self.tools,
            ) {
                let approved = self
                    .gate_on_approval(ctx, &step_id, &call, &reason, APPROVAL_WAIT_TOOL)
                    .await?;
                if !approved {
                    let plan = ctx.task.plan.as_mut().expect("plan");
                    plan.steps[step_index].skip("User did not respond / declined")?;
                    self.store.update_task(&ctx.task).await?;
                    return Ok(());
                }
            }

            if self.tools.risk_level(&call.name).warrants_checkpoint() {
                ctx.checkpoints.snapshot(&ctx.task, &step_id, &call.name);
            }

            ctx.evidence.record_tool_decision(
                &call.name,
                &call.arguments,
                format!(
                    "Model selected {} for step: {}",
                    call.name,
                    clip(&description, 80)
                ),
            );
            let result = self.dispatch_with_retry(ctx, step_index, &call).await?;
            ctx.evidence
                .record_tool_outcome(&call.name, result.text(), result.success);

            if !result.success {
                let plan = ctx.task.plan.as_mut().expect("plan");
                plan.steps[step_index].error = result.error;
            }
            self.store.update_task(&ctx.task).await?;
            return Ok(());
        }

        match call.name.as_str() {
            TASK_COMPLETE => self.handle_task_complete(ctx, step_index, call).await,
            ASK_HUMAN => self.handle_ask_human(ctx, step_index, call).await,
            _ => Ok(()),
        }
    }

    /// `task_complete`: verify the claim when a verifier is configured,
    /// then complete the step and skip everything still pending.
    async fn handle_task_complete(
        &mut self,
        ctx: &mut RunCtx,
        step_index: usize,
        call: ToolCallRequest,
    ) -> Result<()> {
        let step_id = ctx.task.plan.as_ref().expect("plan").steps[step_index]
            .id
            .clone();

        ctx.evidence.record_tool_decision(
            &call.name,
            &call.arguments,
            "Model claims the step is complete",
        );
        let result = self.dispatch_with_retry(ctx, step_index, &call).await?;
        if self.step_terminal(ctx, step_index) {
            // Budget cutoff ended the step mid-dispatch.
            return Ok(());
        }

        let summary = call
            .arguments
            .get("summary")
            .and_then(Value::as_str)
            .map_or_else(|| result.output.clone(), str::to_owned);

        if let Some(verifier) = self.verifier.clone() {
            ctx.sink
                .emit(
                    ctx.event(TaskEventKind::VerifierStarted)
                        .step(&step_id)
                        .content("Verifying completion claims against accumulated evidence"),
                )
                .await;

            let verdict = verifier.verify(&ctx.task.goal, &summary, &ctx.evidence).await;
            ctx.metrics.record_verifier_result(verdict.passed);

            if !verdict.passed {
                ctx.sink
                    .emit(
                        ctx.event(TaskEventKind::VerifierFailed)
                            .step(&step_id)
                            .content(&verdict.critique),
                    )
                    .await;

                let critique = format!(
                    "Verification failed. Fix these unsupported claims before completing \
                     the task:\n{}",
                    verdict.critique
                );

                // Roll back any risky partial state, then make sure the
                // critique is what the model sees next turn. After a
                // restore the rejected record is gone from the snapshot,
                // so the critique is appended instead of overwritten.
                let restored = ctx.checkpoints.restore_for_step(&mut ctx.task, &step_id);
                let step = &mut ctx.task.plan.as_mut().expect("plan").steps[step_index];
                if restored {
                    step.record_tool_call(ToolCallRecord {
                        id: call.id.clone(),
                        tool: call.name.clone(),
                        args: call.arguments.clone(),
                        result: critique,
                        success: false,
                        time_ms: result.execution_time_ms,
                    });
                } else if let Some(last) = step.tool_calls.last_mut() {
                    last.result = critique;
                    last.success = false;
                }
                self.store.update_task(&ctx.task).await?;
                return Ok(());
            }

            ctx.sink
                .emit(
                    ctx.event(TaskEventKind::VerifierPassed)
                        .step(&step_id)
                        .content(&verdict.critique),
                )
                .await;
        }

        let plan = ctx.task.plan.as_mut().expect("plan");
        plan.steps[step_index].complete(summary)?;
        for step in &mut plan.steps {
            if step.id != step_id && !step.status.is_terminal() {
                step.skip("Skipped — task completed early")?;
            }
        }
        self.store.update_task(&ctx.task).await?;
        Ok(())
    }

    /// `ask_human`: raise an approval request and wait for the human.
    async fn handle_ask_human(
        &mut self,
        ctx: &mut RunCtx,
        step_index: usize,
        call: ToolCallRequest,
    ) -> Result<()> {
        let step_id = ctx.task.plan.as_ref().expect("plan").steps[step_index]
            .id
            .clone();
        let question = call
            .arguments
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or("The agent needs your input")
            .to_owned();

        ctx.evidence.record_tool_decision(
            &call.name,
            &call.arguments,
            "Model escalated a question to the human",
        );
        let _ = self.dispatch_with_retry(ctx, step_index, &call).await?;
        if self.step_terminal(ctx, step_index) {
            return Ok(());
        }

        let approved = self
            .gate_on_approval(ctx, &step_id, &call, &question, APPROVAL_WAIT_CHAT)
            .await?;
        if !approved {
            let plan = ctx.task.plan.as_mut().expect("plan");
            plan.steps[step_index].skip("User did not respond / declined")?;
        }
        self.store.update_task(&ctx.task).await?;
        Ok(())
    }

    /// Create and persist an approval request, suspend the task on it, and
    /// wait for resolution. Returns whether the action was approved.
    async fn gate_on_approval(
        &mut self,
        ctx: &mut RunCtx,
        step_id: &str,
        call: &ToolCallRequest,
        reason: &str,
        window: std::time::Duration,
    ) -> Result<bool> {
        let approval = ApprovalRequest::new(
            &ctx.task.id,
            step_id,
            &call.name,
            call.arguments.clone(),
            self.tools.risk_level(&call.name),
            reason,
        );
        let approval_id = approval.id.clone();

        ctx.task.pending_approval = Some(approval.clone());
        ctx.task.transition(TaskStatus::WaitingApproval)?;
        self.store.save_approval(&approval).await?;
        self.store.update_task(&ctx.task).await?;

        ctx.sink
            .emit(
                ctx.event(TaskEventKind::ApprovalNeeded)
                    .step(step_id)
                    .tool(&call.name)
                    .args(call.arguments.to_string())
                    .approval(&approval_id)
                    .content(reason),
            )
            .await;

        let status = self.wait_for_approval(ctx, &approval_id, window).await?;

        ctx.task.pending_approval = None;
        ctx.task.transition(TaskStatus::Executing)?;
        self.store.update_task(&ctx.task).await?;

        Ok(status == ApprovalStatus::Approved)
    }

    /// Poll the persisted approval until it resolves or the window closes;
    /// a timed-out approval is marked expired.
    async fn wait_for_approval(
        &self,
        ctx: &RunCtx,
        approval_id: &str,
        window: std::time::Duration,
    ) -> Result<ApprovalStatus> {
        let deadline = tokio::time::Instant::now() + window;

        loop {
            if ctx.cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(approval) = self.store.get_approval(approval_id).await? {
                if approval.status.is_resolved() {
                    return Ok(approval.status);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return match self
                    .store
                    .resolve_approval(approval_id, ApprovalStatus::Expired, "system")
                    .await
                {
                    Ok(approval) => Ok(approval.status),
                    // A caller resolved it in the same instant; their
                    // decision wins.
                    Err(StoreError::AlreadyResolved(_)) => Ok(self
                        .store
                        .get_approval(approval_id)
                        .await?
                        .map_or(ApprovalStatus::Expired, |a| a.status)),
                    Err(err) => Err(err.into()),
                };
            }

            tokio::time::sleep(APPROVAL_POLL_INTERVAL).await;
        }
    }

    /// Dispatch one call with transient-failure retries. Every attempt
    /// emits its own `tool_called`/`tool_result` pair, counts against the
    /// tool-call budget, and lands in the step history; the budget is
    /// re-checked after each result.
    pub(crate) async fn dispatch_with_retry(
        &mut self,
        ctx: &mut RunCtx,
        step_index: usize,
        call: &ToolCallRequest,
    ) -> Result<ToolResult> {
        let tool_ctx = ToolContext::new(&ctx.task.workspace_id, &ctx.task.id);
        let step_id = ctx.task.plan.as_ref().expect("plan").steps[step_index]
            .id
            .clone();
        let mut last = ToolResult::err("not dispatched", 0);

        for attempt in 0..RETRY_MAX_ATTEMPTS {
            ctx.sink
                .emit(
                    ctx.event(TaskEventKind::ToolCalled)
                        .step(&step_id)
                        .tool(&call.name)
                        .args(call.arguments.to_string()),
                )
                .await;

            let result = self.tools.dispatch(call, &tool_ctx).await;
            ctx.task.record_tool_call();
            ctx.metrics
                .record_tool_execution(result.execution_time_ms, result.success);

            ctx.sink
                .emit(
                    ctx.event(TaskEventKind::ToolResult)
                        .step(&step_id)
                        .tool(&call.name)
                        .result(result.text()),
                )
                .await;

            record_attempt(ctx, step_index, call, &result);
            let transient = !result.success
                && result.error.as_deref().is_some_and(is_transient_error);
            last = result;

            if let Some(budget_error) = self.guardrails.check_budget(&ctx.task, ctx.elapsed()) {
                warn!(error = %budget_error, "budget exhausted mid-step");
                let step = &mut ctx.task.plan.as_mut().expect("plan").steps[step_index];
                if !step.status.is_terminal() {
                    step.complete(format!("Stopped: {budget_error}"))?;
                }
                self.store.update_task(&ctx.task).await?;
                return Ok(last);
            }

            if last.success || !transient || attempt + 1 == RETRY_MAX_ATTEMPTS {
                break;
            }

            let delay = retry_delay(attempt);
            info!(
                tool = %call.name,
                attempt = attempt + 1,
                delay_s = delay.as_secs(),
                "retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
        }

        Ok(last)
    }

    /// Run a batch of independent calls concurrently under the parallel
    /// bound. Results are integrated in completion order.
    async fn dispatch_parallel(
        &mut self,
        ctx: &mut RunCtx,
        step_index: usize,
        batch: Vec<ToolCallRequest>,
    ) -> Result<()> {
        info!(
            count = batch.len(),
            tools = ?batch.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "parallel tool dispatch"
        );

        let step_id = ctx.task.plan.as_ref().expect("plan").steps[step_index]
            .id
            .clone();
        let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_TOOLS));
        let stop = Arc::new(AtomicBool::new(false));
        let tool_ctx = ToolContext::new(&ctx.task.workspace_id, &ctx.task.id);
        let progress = progress_of(&ctx.task);
        let task_id = ctx.task.id.clone();

        let mut workers: FuturesUnordered<_> = batch
            .into_iter()
            .map(|call| {
                run_parallel_worker(
                    call,
                    Arc::clone(&self.tools),
                    tool_ctx.clone(),
                    ctx.sink.clone(),
                    task_id.clone(),
                    step_id.clone(),
                    progress,
                    Arc::clone(&semaphore),
                    Arc::clone(&stop),
                )
            })
            .collect();

        while let Some((call, attempts)) = workers.next().await {
            if attempts.is_empty() {
                continue;
            }

            for result in &attempts {
                ctx.task.record_tool_call();
                ctx.metrics
                    .record_tool_execution(result.execution_time_ms, result.success);
                record_attempt(ctx, step_index, &call, result);
            }

            if let Some(final_result) = attempts.last() {
                ctx.evidence.record_tool_decision(
                    &call.name,
                    &call.arguments,
                    format!("Model selected {} in a parallel batch", call.name),
                );
                ctx.evidence.record_tool_outcome(
                    &call.name,
                    final_result.text(),
                    final_result.success,
                );
                if !final_result.success {
                    let step = &mut ctx.task.plan.as_mut().expect("plan").steps[step_index];
                    step.error = final_result.error.clone();
                }
            }

            if !self.step_terminal(ctx, step_index) {
                if let Some(budget_error) = self.guardrails.check_budget(&ctx.task, ctx.elapsed())
                {
                    warn!(error = %budget_error, "budget exhausted during parallel batch");
                    stop.store(true, Ordering::SeqCst);
                    let step = &mut ctx.task.plan.as_mut().expect("plan").steps[step_index];
                    step.complete(format!("Stopped: {budget_error}"))?;
                    self.store.update_task(&ctx.task).await?;
                    // Keep draining: in-flight results still land in the
                    // step history, they are just never fed back.
                }
            }
        }

        self.store.update_task(&ctx.task).await?;
        Ok(())
    }
}

/// Append one attempt to the step history and the diagnostic tracker.
fn record_attempt(
    ctx: &mut RunCtx,
    step_index: usize,
    call: &ToolCallRequest,
    result: &ToolResult,
) {
    let step = &mut ctx.task.plan.as_mut().expect("plan").steps[step_index];
    step.record_tool_call(ToolCallRecord {
        id: call.id.clone(),
        tool: call.name.clone(),
        args: call.arguments.clone(),
        result: result.text().to_owned(),
        success: result.success,
        time_ms: result.execution_time_ms,
    });
    let step_id = step.id.clone();
    ctx.tracker(&step_id).record(
        &call.name,
        &call.arguments,
        result.success,
        result.error.as_deref(),
    );
}

/// One parallel worker: dispatch with retries, emitting its own event
/// pairs. Returns every attempt's result for the integration pass.
#[allow(clippy::too_many_arguments)]
async fn run_parallel_worker(
    call: ToolCallRequest,
    registry: Arc<ToolRegistry>,
    tool_ctx: ToolContext,
    sink: EventSink,
    task_id: String,
    step_id: String,
    progress: Progress,
    semaphore: Arc<Semaphore>,
    stop: Arc<AtomicBool>,
) -> (ToolCallRequest, Vec<ToolResult>) {
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return (call, Vec::new());
    };
    if stop.load(Ordering::SeqCst) {
        // Budget ran out before this call started; never issue it.
        return (call, Vec::new());
    }

    let mut attempts = Vec::new();
    for attempt in 0..RETRY_MAX_ATTEMPTS {
        sink.emit(
            TaskEvent::new(TaskEventKind::ToolCalled, &task_id, progress)
                .step(&step_id)
                .tool(&call.name)
                .args(call.arguments.to_string()),
        )
        .await;

        let result = registry.dispatch(&call, &tool_ctx).await;

        sink.emit(
            TaskEvent::new(TaskEventKind::ToolResult, &task_id, progress)
                .step(&step_id)
                .tool(&call.name)
                .result(result.text()),
        )
        .await;

        let retry = !result.success
            && result.error.as_deref().is_some_and(is_transient_error)
            && attempt + 1 < RETRY_MAX_ATTEMPTS;
        attempts.push(result);

        if !retry || stop.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(retry_delay(attempt)).await;
    }

    (call, attempts)
}
