//! Prompt construction for the reasoning loop.
//!
//! Chat-embedded tasks start from the pre-seeded conversation; autonomous
//! tasks get a structured system prompt with goal, step, progress, and an
//! observations block. Recent tool calls are replayed verbatim; older ones
//! are summarized, never discarded, so the model knows what it already
//! tried.

use crate::plan::Step;
use crate::provider::{ChatMessage, ToolCallRequest};
use crate::task::Task;

use super::diagnostics::DiagnosticTracker;

/// Tool calls replayed verbatim; anything older is summarized.
const RECENT_CALL_WINDOW: usize = 10;

const SYSTEM_PROMPT: &str = "\
You are an autonomous agent executing a multi-step task.

Current goal: {goal}
Current step: {step}

Instructions:
1. Analyze the situation and decide which tool to call next.
2. You may call up to 5 tools per turn if they are independent, low-risk, \
and do not require approval. Wait for all results before proceeding.
3. When the step is complete, call `task_complete` with a summary of what \
you accomplished.
4. If you need clarification from the user, call `ask_human` with your \
question.
5. When a tool fails, diagnose before retrying. Never repeat the exact \
same call with identical arguments.
6. Before calling `task_complete`, cite the tool outputs that prove your \
work; unsupported claims will be rejected by an independent verifier.

Progress: Step {step_index}/{total_steps} | Iteration {iteration}/{max_iterations}
{diagnostics}
Previous observations for this step:
{observations}";

/// Build the message list for one reasoning turn of `step`.
#[must_use]
pub fn build_messages(task: &Task, step: &Step, tracker: &DiagnosticTracker) -> Vec<ChatMessage> {
    if task.is_chat_embedded() {
        build_chat_messages(task, step, tracker)
    } else {
        build_autonomous_messages(task, step, tracker)
    }
}

fn build_chat_messages(task: &Task, step: &Step, tracker: &DiagnosticTracker) -> Vec<ChatMessage> {
    let mut messages = task.messages.clone();

    if let Some(block) = tracker.diagnostic_block() {
        messages.push(ChatMessage::system(block));
    }

    append_recent_calls(&mut messages, step);
    messages
}

fn build_autonomous_messages(
    task: &Task,
    step: &Step,
    tracker: &DiagnosticTracker,
) -> Vec<ChatMessage> {
    let (_, total) = task.plan.as_ref().map_or((0, 1), crate::plan::Plan::progress);

    let observations = if step.tool_calls.is_empty() {
        "(none yet)".to_owned()
    } else {
        step.tool_calls
            .iter()
            .map(|tc| format!("[{}] -> {}", tc.tool, tc.result))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let diagnostics = tracker
        .diagnostic_block()
        .map(|block| format!("\n{block}\n"))
        .unwrap_or_default();

    let system = SYSTEM_PROMPT
        .replace("{goal}", &task.goal)
        .replace("{step}", &step.description)
        .replace("{step_index}", &(step.index + 1).to_string())
        .replace("{total_steps}", &total.to_string())
        .replace("{iteration}", &task.iterations.to_string())
        .replace("{max_iterations}", &task.config.max_iterations.to_string())
        .replace("{diagnostics}", &diagnostics)
        .replace("{observations}", &observations);

    let mut messages = vec![ChatMessage::system(system)];

    if step.tool_calls.is_empty() {
        messages.push(ChatMessage::user(format!(
            "Execute this step: {}",
            step.description
        )));
    } else {
        let mut continue_msg = format!("Continue executing: {}", step.description);

        // Older calls are summarized so nothing the model tried is lost.
        if step.tool_calls.len() > RECENT_CALL_WINDOW {
            let skipped = &step.tool_calls[..step.tool_calls.len() - RECENT_CALL_WINDOW];
            let summary: Vec<String> = skipped
                .iter()
                .map(|tc| {
                    let mark = if tc.success { "ok" } else { "failed" };
                    let args: String = tc.args.to_string().chars().take(60).collect();
                    format!("  [{mark}] {}({args})", tc.tool)
                })
                .collect();
            continue_msg.push_str(&format!(
                "\n\nEarlier attempts ({} calls, summarized):\n{}",
                skipped.len(),
                summary.join("\n")
            ));
        }

        messages.push(ChatMessage::user(continue_msg));
        append_recent_calls(&mut messages, step);
    }

    messages
}

/// Replay the most recent tool calls as assistant/tool message pairs.
fn append_recent_calls(messages: &mut Vec<ChatMessage>, step: &Step) {
    let recent = step
        .tool_calls
        .iter()
        .skip(step.tool_calls.len().saturating_sub(RECENT_CALL_WINDOW));
    for record in recent {
        messages.push(ChatMessage::assistant_tool_calls(vec![
            ToolCallRequest::new(&record.id, &record.tool, record.args.clone()),
        ]));
        messages.push(ChatMessage::tool(&record.id, &record.result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardrailConfig;
    use crate::plan::{Plan, ToolCallRecord};
    use crate::provider::Role;

    fn task() -> Task {
        let mut task = Task::new("u", "ws", "ship the report", GuardrailConfig::default());
        task.plan = Some(Plan::new("ship the report", vec![Step::new(0, "Collect data")]));
        task
    }

    fn record(id: &str, success: bool) -> ToolCallRecord {
        ToolCallRecord {
            id: id.to_owned(),
            tool: "fetch_url".to_owned(),
            args: serde_json::json!({"url": id}),
            result: "body".to_owned(),
            success,
            time_ms: 3,
        }
    }

    #[test]
    fn first_turn_has_system_and_execute() {
        let task = task();
        let step = Step::new(0, "Collect data");
        let messages = build_messages(&task, &step, &DiagnosticTracker::new());

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        let system = messages[0].content.as_deref().unwrap();
        assert!(system.contains("ship the report"));
        assert!(system.contains("(none yet)"));
        assert!(messages[1].content.as_deref().unwrap().starts_with("Execute this step"));
    }

    #[test]
    fn later_turns_replay_recent_calls() {
        let task = task();
        let mut step = Step::new(0, "Collect data");
        for i in 0..3 {
            step.record_tool_call(record(&format!("c{i}"), true));
        }
        let messages = build_messages(&task, &step, &DiagnosticTracker::new());

        // system + continue + 3 assistant/tool pairs
        assert_eq!(messages.len(), 8);
        assert!(messages[1].content.as_deref().unwrap().starts_with("Continue executing"));
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[3].role, Role::Tool);
    }

    #[test]
    fn old_calls_are_summarized_not_dropped() {
        let task = task();
        let mut step = Step::new(0, "Collect data");
        for i in 0..15 {
            step.record_tool_call(record(&format!("c{i}"), i % 2 == 0));
        }
        let messages = build_messages(&task, &step, &DiagnosticTracker::new());

        let continue_msg = messages[1].content.as_deref().unwrap();
        assert!(continue_msg.contains("Earlier attempts (5 calls, summarized)"));
        // Only the recent window is replayed verbatim.
        let pairs = messages.len() - 2;
        assert_eq!(pairs, RECENT_CALL_WINDOW * 2);
    }

    #[test]
    fn chat_embedded_starts_from_conversation() {
        let mut task = task();
        task.messages = vec![
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user("hello"),
        ];
        let step = Step::new(0, "Respond to the user");
        let messages = build_messages(&task, &step, &DiagnosticTracker::new());

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content.as_deref(), Some("hello"));
    }
}
