//! End-to-end tests driving the task service with scripted providers.

#![allow(clippy::unwrap_used, clippy::panic, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use peregrine::error::ToolError;
use peregrine::prelude::*;

// ── Test tools ───────────────────────────────────────────────────────

/// Succeeds immediately with a fixed payload.
struct ProbeHandler;

#[async_trait]
impl ToolHandler for ProbeHandler {
    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> std::result::Result<Value, ToolError> {
        Ok(Value::String("ok".to_owned()))
    }
}

/// Fails with a transient error a fixed number of times, then succeeds.
struct FlakyHandler {
    failures: AtomicUsize,
}

#[async_trait]
impl ToolHandler for FlakyHandler {
    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> std::result::Result<Value, ToolError> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ToolError::execution("connection timeout"));
        }
        Ok(Value::String("ok".to_owned()))
    }
}

fn tool(name: &str, description: &str) -> ToolSpec {
    ToolSpec::new(
        ToolDefinition::new(name, description, json!({"type": "object", "properties": {}})),
        Arc::new(ProbeHandler),
    )
}

fn flaky_tool(name: &str, failures: usize) -> ToolSpec {
    ToolSpec::new(
        ToolDefinition::new(name, "Fetch a URL", json!({"type": "object", "properties": {}})),
        Arc::new(FlakyHandler {
            failures: AtomicUsize::new(failures),
        }),
    )
}

fn call(id: &str, name: &str, args: Value) -> ToolCallRequest {
    ToolCallRequest::new(id, name, args)
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    service: TaskService,
    store: Arc<MemoryStore>,
    local: Arc<MockProvider>,
}

fn harness(script: Vec<ScriptedTurn>, specs: Vec<ToolSpec>) -> Harness {
    harness_with_cloud(script, Vec::new(), specs)
}

fn harness_with_cloud(
    local_script: Vec<ScriptedTurn>,
    cloud_script: Vec<ScriptedTurn>,
    specs: Vec<ToolSpec>,
) -> Harness {
    let local = Arc::new(MockProvider::new("ollama", local_script).local());
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::clone(&local) as Arc<dyn LlmProvider>);
    if !cloud_script.is_empty() {
        providers.register(Arc::new(MockProvider::new("google", cloud_script)));
    }

    let mut tools = ToolRegistry::new();
    for spec in specs {
        tools.register(spec);
    }

    let store = Arc::new(MemoryStore::new());
    let service = TaskService::new(
        providers,
        "ollama",
        "qwen3:8b",
        Arc::new(tools),
        Arc::clone(&store) as Arc<dyn TaskStore>,
    );

    Harness {
        service,
        store,
        local,
    }
}

/// Drain the live event channel until a terminal event arrives.
async fn drain(handle: &mut TaskHandle) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        let terminal = event.kind.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

/// Drain until (and including) the first event of `kind`.
async fn drain_until(handle: &mut TaskHandle, kind: TaskEventKind) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        let hit = event.kind == kind || event.kind.is_terminal();
        events.push(event);
        if hit {
            break;
        }
    }
    events
}

fn kinds(events: &[TaskEvent]) -> Vec<TaskEventKind> {
    events.iter().map(|e| e.kind).collect()
}

/// Assert that `needles` appear in `haystack` in order (not necessarily
/// adjacent).
fn assert_subsequence(haystack: &[TaskEventKind], needles: &[TaskEventKind]) {
    let mut iter = haystack.iter();
    for needle in needles {
        assert!(
            iter.any(|k| k == needle),
            "expected {needle:?} in order within {haystack:?}"
        );
    }
}

// ── Scenario: happy path, single chat step ───────────────────────────

#[tokio::test]
async fn chat_happy_path_takes_conversational_shortcut() {
    let h = harness(vec![ScriptedTurn::Text("hello".to_owned())], vec![]);

    let mut handle = h
        .service
        .start_task(
            StartTaskRequest::new("u1", "ws1", "Echo hello back to me")
                .messages(vec![ChatMessage::user("Echo hello back to me")]),
        )
        .await
        .unwrap();
    let events = drain(&mut handle).await;

    assert_subsequence(
        &kinds(&events),
        &[
            TaskEventKind::PlanCreated,
            TaskEventKind::StepStarted,
            TaskEventKind::StepComplete,
            TaskEventKind::TaskComplete,
        ],
    );

    let step_complete = events
        .iter()
        .find(|e| e.kind == TaskEventKind::StepComplete)
        .unwrap();
    assert_eq!(step_complete.content, "hello");

    // The shortcut offered no tools to the model.
    let requests = h.local.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].tools.is_empty());

    let task = h.store.get_task(&handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(task.result.as_deref(), Some("hello"));
}

// ── Scenario: retry on transient tool failure ────────────────────────

#[tokio::test(start_paused = true)]
async fn transient_tool_failure_retries_with_backoff() {
    let h = harness(
        vec![
            ScriptedTurn::Text(r#"["Fetch the page"]"#.to_owned()),
            ScriptedTurn::ToolCalls(vec![call("c1", "fetch_url", json!({}))]),
            ScriptedTurn::ToolCalls(vec![call(
                "c2",
                "task_complete",
                json!({"summary": "fetched"}),
            )]),
        ],
        vec![flaky_tool("fetch_url", 2)],
    );

    let mut handle = h
        .service
        .start_task(StartTaskRequest::new("u1", "ws1", "Fetch example.com"))
        .await
        .unwrap();
    let events = drain(&mut handle).await;

    // Three attempts, each with its own called/result pair.
    let fetch_events: Vec<&TaskEvent> = events
        .iter()
        .filter(|e| e.tool_name.as_deref() == Some("fetch_url"))
        .collect();
    let fetch_kinds: Vec<TaskEventKind> = fetch_events.iter().map(|e| e.kind).collect();
    assert_eq!(
        fetch_kinds,
        vec![
            TaskEventKind::ToolCalled,
            TaskEventKind::ToolResult,
            TaskEventKind::ToolCalled,
            TaskEventKind::ToolResult,
            TaskEventKind::ToolCalled,
            TaskEventKind::ToolResult,
        ]
    );
    let results: Vec<&str> = fetch_events
        .iter()
        .filter(|e| e.kind == TaskEventKind::ToolResult)
        .map(|e| e.tool_result.as_deref().unwrap())
        .collect();
    assert!(results[0].contains("connection timeout"));
    assert!(results[1].contains("connection timeout"));
    assert_eq!(results[2], "ok");

    assert_subsequence(
        &kinds(&events),
        &[TaskEventKind::StepComplete, TaskEventKind::TaskComplete],
    );

    // 3 fetch attempts + 1 task_complete dispatch.
    let task = h.store.get_task(&handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.tool_calls_count, 4);
    assert_eq!(task.status, TaskStatus::Complete);
}

// ── Scenario: approval gate on a high-risk tool ──────────────────────

fn approval_harness() -> Harness {
    harness(
        vec![
            ScriptedTurn::Text(r#"["Remove the scratch file"]"#.to_owned()),
            ScriptedTurn::ToolCalls(vec![call(
                "c1",
                "shell_execute",
                json!({"command": "rm -rf /tmp/x"}),
            )]),
            ScriptedTurn::ToolCalls(vec![call(
                "c2",
                "task_complete",
                json!({"summary": "removed"}),
            )]),
        ],
        vec![tool("shell_execute", "Run a shell command").risk(RiskLevel::High)],
    )
}

#[tokio::test(start_paused = true)]
async fn high_risk_tool_waits_for_approval_then_dispatches() {
    let h = approval_harness();
    let mut handle = h
        .service
        .start_task(
            StartTaskRequest::new("u1", "ws1", "Clean up /tmp/x")
                .guardrails(GuardrailConfig::default().auto_approve_risk(RiskLevel::Medium)),
        )
        .await
        .unwrap();

    let before = drain_until(&mut handle, TaskEventKind::ApprovalNeeded).await;
    let approval_event = before.last().unwrap();
    assert_eq!(approval_event.kind, TaskEventKind::ApprovalNeeded);
    assert_eq!(approval_event.tool_name.as_deref(), Some("shell_execute"));
    let approval_id = approval_event.approval_id.clone().unwrap();

    // No dispatch happened before the approval.
    assert!(before.iter().all(|e| e.kind != TaskEventKind::ToolCalled));
    let task = h.store.get_task(&handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::WaitingApproval);
    assert!(task.pending_approval.is_some());

    h.service
        .approve_action(&approval_id, true, "u1")
        .await
        .unwrap();

    let after = drain(&mut handle).await;
    assert_subsequence(
        &kinds(&after),
        &[
            TaskEventKind::ToolCalled,
            TaskEventKind::ToolResult,
            TaskEventKind::StepComplete,
            TaskEventKind::TaskComplete,
        ],
    );

    // Second resolution reports the conflict.
    let second = h.service.approve_action(&approval_id, false, "u2").await;
    assert!(matches!(second, Err(ServiceError::AlreadyResolved)));
}

#[tokio::test(start_paused = true)]
async fn denied_approval_skips_the_step() {
    let h = approval_harness();
    let mut handle = h
        .service
        .start_task(
            StartTaskRequest::new("u1", "ws1", "Clean up /tmp/x")
                .guardrails(GuardrailConfig::default().auto_approve_risk(RiskLevel::Medium)),
        )
        .await
        .unwrap();

    let before = drain_until(&mut handle, TaskEventKind::ApprovalNeeded).await;
    let approval_id = before.last().unwrap().approval_id.clone().unwrap();

    h.service
        .approve_action(&approval_id, false, "u1")
        .await
        .unwrap();

    let after = drain(&mut handle).await;
    // The gated tool never ran.
    assert!(after.iter().all(|e| e.tool_name.as_deref() != Some("shell_execute")
        || e.kind == TaskEventKind::ApprovalNeeded));

    let task = h.store.get_task(&handle.task_id).await.unwrap().unwrap();
    let step = &task.plan.as_ref().unwrap().steps[0];
    assert_eq!(step.status, StepStatus::Skipped);
    assert_eq!(step.result.as_deref(), Some("User did not respond / declined"));
    assert_eq!(task.status, TaskStatus::Complete);
}

// ── Scenario: budget cutoff mid-parallel-batch ───────────────────────

#[tokio::test]
async fn budget_cutoff_stops_parallel_batch() {
    let calls: Vec<ToolCallRequest> = (0..5)
        .map(|i| call(&format!("c{i}"), "probe", json!({})))
        .collect();
    let h = harness(
        vec![
            ScriptedTurn::Text(r#"["Probe all endpoints"]"#.to_owned()),
            ScriptedTurn::ToolCalls(calls),
        ],
        vec![tool("probe", "Probe an endpoint")],
    );

    let mut handle = h
        .service
        .start_task(
            StartTaskRequest::new("u1", "ws1", "Probe the fleet")
                .guardrails(GuardrailConfig::default().max_tool_calls(2)),
        )
        .await
        .unwrap();
    let events = drain(&mut handle).await;

    let task = h.store.get_task(&handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("tool-call budget exceeded"));

    let step = &task.plan.as_ref().unwrap().steps[0];
    assert_eq!(step.status, StepStatus::Complete);
    assert_eq!(step.result.as_deref(), Some("Stopped: tool-call budget exceeded"));

    // In-flight results were still persisted to the step history.
    assert!(step.tool_calls.len() >= 2);
    assert!(task.tool_calls_count >= 2);

    // Every dispatched tool has a called/result pair.
    let called = events
        .iter()
        .filter(|e| e.kind == TaskEventKind::ToolCalled)
        .count();
    let resulted = events
        .iter()
        .filter(|e| e.kind == TaskEventKind::ToolResult)
        .count();
    assert_eq!(called, resulted);
}

// ── Scenario: complexity escalation to a hosted provider ─────────────

#[tokio::test]
async fn complex_step_escalates_to_cloud() {
    let h = harness_with_cloud(
        vec![ScriptedTurn::Text(
            r#"["architect a distributed write-ahead log with exactly-once semantics"]"#
                .to_owned(),
        )],
        vec![ScriptedTurn::ToolCalls(vec![call(
            "c1",
            "task_complete",
            json!({"summary": "designed"}),
        )])],
        vec![],
    );

    let mut handle = h
        .service
        .start_task(StartTaskRequest::new("u1", "ws1", "Design the WAL"))
        .await
        .unwrap();
    let events = drain(&mut handle).await;

    let routing = events
        .iter()
        .find(|e| e.kind == TaskEventKind::RoutingInfo)
        .unwrap();
    let payload: Value = serde_json::from_str(&routing.content).unwrap();
    assert_eq!(payload["provider"], "google");
    assert_eq!(payload["model"], "gemini-2.5-pro");

    // The local model only served the planning call.
    assert_eq!(h.local.calls(), 1);

    let task = h.store.get_task(&handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
}

#[tokio::test]
async fn escalation_keeps_local_route_without_cloud() {
    let h = harness(
        vec![
            ScriptedTurn::Text(
                r#"["architect a distributed write-ahead log with exactly-once semantics"]"#
                    .to_owned(),
            ),
            ScriptedTurn::ToolCalls(vec![call(
                "c1",
                "task_complete",
                json!({"summary": "designed"}),
            )]),
        ],
        vec![],
    );

    let mut handle = h
        .service
        .start_task(StartTaskRequest::new("u1", "ws1", "Design the WAL"))
        .await
        .unwrap();
    let events = drain(&mut handle).await;

    let routing = events
        .iter()
        .find(|e| e.kind == TaskEventKind::RoutingInfo)
        .unwrap();
    let payload: Value = serde_json::from_str(&routing.content).unwrap();
    assert_eq!(payload["provider"], "ollama");
}

// ── Scenario: verifier rejects an unsupported completion ─────────────

struct DeletionVerifier;

#[async_trait]
impl Verifier for DeletionVerifier {
    async fn verify(&self, _goal: &str, _summary: &str, evidence: &EvidenceChain) -> Verdict {
        if evidence.tool_outputs("file_delete").is_empty() {
            Verdict::reject("No file_delete output supports the claimed deletion")
        } else {
            Verdict::pass("Deletion is supported by tool evidence")
        }
    }
}

#[tokio::test]
async fn verifier_rejects_unsupported_completion_then_passes() {
    let h = harness(
        vec![
            ScriptedTurn::Text(r#"["Delete the scratch file"]"#.to_owned()),
            ScriptedTurn::ToolCalls(vec![call(
                "c1",
                "task_complete",
                json!({"summary": "I deleted the file"}),
            )]),
            ScriptedTurn::ToolCalls(vec![call("c2", "file_delete", json!({}))]),
            ScriptedTurn::ToolCalls(vec![call(
                "c3",
                "task_complete",
                json!({"summary": "Deleted; file_delete output confirms it"}),
            )]),
        ],
        vec![tool("file_delete", "Delete a file")],
    );
    let service = h.service.with_verifier(Arc::new(DeletionVerifier));

    let mut handle = service
        .start_task(StartTaskRequest::new("u1", "ws1", "Delete /tmp/scratch"))
        .await
        .unwrap();
    let events = drain(&mut handle).await;
    let event_kinds = kinds(&events);

    assert_subsequence(
        &event_kinds,
        &[
            TaskEventKind::VerifierStarted,
            TaskEventKind::VerifierFailed,
            TaskEventKind::VerifierPassed,
            TaskEventKind::StepComplete,
            TaskEventKind::TaskComplete,
        ],
    );

    // The rejection surfaced before any step completion.
    let first_fail = event_kinds
        .iter()
        .position(|k| *k == TaskEventKind::VerifierFailed)
        .unwrap();
    let first_complete = event_kinds
        .iter()
        .position(|k| *k == TaskEventKind::StepComplete)
        .unwrap();
    assert!(first_fail < first_complete);

    let task = h.store.get_task(&handle.task_id).await.unwrap().unwrap();
    let step = &task.plan.as_ref().unwrap().steps[0];
    assert_eq!(step.status, StepStatus::Complete);
    assert!(step
        .tool_calls
        .iter()
        .any(|r| !r.success && r.result.contains("Verification failed")));
}

// ── Stream replay and idempotence ────────────────────────────────────

#[tokio::test]
async fn replay_matches_live_events() {
    let h = harness(vec![ScriptedTurn::Text("hi".to_owned())], vec![]);

    let mut handle = h
        .service
        .start_task(
            StartTaskRequest::new("u1", "ws1", "Say hi")
                .messages(vec![ChatMessage::user("Say hi")]),
        )
        .await
        .unwrap();
    let live = drain(&mut handle).await;

    let mut replayed = Vec::new();
    let mut stream = h.service.stream_task_events(&handle.task_id).await.unwrap();
    use futures::StreamExt as _;
    while let Some(event) = stream.next().await {
        replayed.push(event);
    }

    assert_eq!(kinds(&live), kinds(&replayed));

    let missing = h.service.stream_task_events("no-such-task").await;
    assert!(matches!(missing, Err(ServiceError::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn cancellation_unwinds_at_next_suspension_point() {
    let h = approval_harness();
    let mut handle = h
        .service
        .start_task(
            StartTaskRequest::new("u1", "ws1", "Clean up /tmp/x")
                .guardrails(GuardrailConfig::default().auto_approve_risk(RiskLevel::Medium)),
        )
        .await
        .unwrap();

    let before = drain_until(&mut handle, TaskEventKind::ApprovalNeeded).await;
    let approval_id = before.last().unwrap().approval_id.clone().unwrap();

    h.service.cancel_task(&handle.task_id).await.unwrap();
    let after = drain(&mut handle).await;
    assert_eq!(after.last().unwrap().kind, TaskEventKind::TaskPaused);

    let task = h.store.get_task(&handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.pending_approval.is_none());

    // The orphaned approval was expired, not left dangling.
    let approval = h.store.get_approval(&approval_id).await.unwrap().unwrap();
    assert_eq!(approval.status, ApprovalStatus::Expired);

    // Cancelling again is a no-op.
    h.service.cancel_task(&handle.task_id).await.unwrap();
    let task = h.store.get_task(&handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn cancel_of_terminal_task_is_noop() {
    let h = harness(vec![ScriptedTurn::Text("done".to_owned())], vec![]);

    let mut handle = h
        .service
        .start_task(
            StartTaskRequest::new("u1", "ws1", "Quick task")
                .messages(vec![ChatMessage::user("Quick task")]),
        )
        .await
        .unwrap();
    drain(&mut handle).await;

    h.service.cancel_task(&handle.task_id).await.unwrap();
    let task = h.store.get_task(&handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
}

#[tokio::test]
async fn empty_goal_is_rejected() {
    let h = harness(vec![], vec![]);
    let outcome = h
        .service
        .start_task(StartTaskRequest::new("u1", "ws1", "   "))
        .await;
    assert!(matches!(outcome, Err(ServiceError::InvalidArgument(_))));
}

#[tokio::test]
async fn listing_filters_by_status() {
    let h = harness(vec![ScriptedTurn::Text("done".to_owned())], vec![]);

    let mut handle = h
        .service
        .start_task(
            StartTaskRequest::new("u1", "ws1", "List me")
                .messages(vec![ChatMessage::user("List me")]),
        )
        .await
        .unwrap();
    drain(&mut handle).await;

    let complete = h
        .service
        .list_tasks("u1", Some("ws1"), Some(TaskStatus::Complete))
        .await
        .unwrap();
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0].id, handle.task_id);

    let failed = h
        .service
        .list_tasks("u1", None, Some(TaskStatus::Failed))
        .await
        .unwrap();
    assert!(failed.is_empty());
}
