//! Context compaction — keep the prompt inside the provider's window.
//!
//! Token counts are estimated (chars / 4); when the conversation exceeds
//! the compaction budget, the oldest non-system messages are dropped in
//! pairs until it fits. If even the compacted prompt does not fit the
//! window, the caller escalates to a provider with a larger one.

use tracing::debug;

use crate::provider::{ChatMessage, Role};

/// Fraction of the context window the prompt may occupy (the rest is
/// headroom for tool schemas and the completion).
const WINDOW_FILL_RATIO: f64 = 0.75;

/// Estimated token count of a message list.
#[must_use]
pub fn estimate_tokens(messages: &[ChatMessage]) -> u32 {
    messages.iter().map(ChatMessage::estimated_tokens).sum()
}

/// Trim the oldest non-system messages until the estimate fits the
/// compaction budget for `context_window`. Returns whether anything was
/// removed.
pub fn compact_messages(messages: &mut Vec<ChatMessage>, context_window: u32) -> bool {
    let budget = budget_for(context_window);
    if estimate_tokens(messages) <= budget {
        return false;
    }

    let mut removed = 0usize;
    while estimate_tokens(messages) > budget {
        // Keep the system prompt and the most recent exchange.
        let Some(index) = messages
            .iter()
            .position(|m| m.role != Role::System)
            .filter(|&i| i + 2 < messages.len())
        else {
            break;
        };
        messages.remove(index);
        removed += 1;
    }

    if removed > 0 {
        debug!(removed, budget, "compacted context");
    }
    removed > 0
}

/// Whether the (already compacted) prompt still exceeds the window, so the
/// call should escalate to a provider with more context.
#[must_use]
pub fn needs_escalation(messages: &[ChatMessage], context_window: u32) -> bool {
    estimate_tokens(messages) > budget_for(context_window)
}

fn budget_for(context_window: u32) -> u32 {
    (f64::from(context_window) * WINDOW_FILL_RATIO) as u32
}
