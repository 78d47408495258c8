//! Context window trimming.
//!
//! Fits the running message list into
//! `max_context_tokens - estimate(system_prompt) - max_output_tokens`.
//!
//! Removal order:
//! 1. Units older than the current user turn, oldest first.
//! 2. Units after the current user turn (earlier tool rounds of this
//!    invocation), oldest first.
//!
//! The current user turn (the last `user` message) is never removed. A
//! "unit" is either a single message or an assistant message carrying tool
//! calls together with the tool-result messages that answer it; units are
//! only ever removed whole.

use std::ops::Range;

use reagent_config::ContextConfig;
use reagent_core::message::{Message, Role};
use tracing::debug;

use super::token::{estimate_message_tokens, estimate_tokens};

/// Outcome of a trim, for logging and inspection.
#[derive(Debug, Clone)]
pub struct TrimOutcome {
    pub messages: Vec<Message>,
    /// Number of messages removed
    pub dropped: usize,
    /// Estimated tokens of the returned messages
    pub tokens: usize,
    /// Budget the messages had to fit
    pub budget: usize,
}

impl TrimOutcome {
    /// False when even the minimal set is over budget.
    pub fn fits(&self) -> bool {
        self.tokens <= self.budget
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextWindow {
    max_context_tokens: usize,
    max_output_tokens: usize,
}

impl ContextWindow {
    pub fn new(max_context_tokens: usize, max_output_tokens: usize) -> Self {
        Self {
            max_context_tokens,
            max_output_tokens,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(
            config.max_context_tokens as usize,
            config.max_output_tokens as usize,
        )
    }

    /// Same window with a different output reserve.
    pub fn with_output_reserve(self, max_output_tokens: usize) -> Self {
        Self {
            max_output_tokens,
            ..self
        }
    }

    pub fn max_output_tokens(&self) -> usize {
        self.max_output_tokens
    }

    /// Tokens available for messages once the system prompt and the output
    /// reserve are paid for.
    pub fn budget(&self, system_prompt: &str) -> usize {
        self.max_context_tokens
            .saturating_sub(estimate_tokens(system_prompt))
            .saturating_sub(self.max_output_tokens)
    }

    /// Trim `messages` to fit the window.
    pub fn trim(&self, messages: &[Message], system_prompt: &str) -> Vec<Message> {
        self.trim_with_report(messages, system_prompt).messages
    }

    pub fn trim_with_report(&self, messages: &[Message], system_prompt: &str) -> TrimOutcome {
        let budget = self.budget(system_prompt);
        let costs: Vec<usize> = messages.iter().map(estimate_message_tokens).collect();
        let mut total: usize = costs.iter().sum();

        if total <= budget {
            return TrimOutcome {
                messages: messages.to_vec(),
                dropped: 0,
                tokens: total,
                budget,
            };
        }

        let units = group_units(messages);
        let anchor = messages.iter().rposition(|m| m.role == Role::User);

        // Removal order: before the anchor, then after it.
        let (before, after): (Vec<usize>, Vec<usize>) = match anchor {
            Some(a) => {
                let before = (0..units.len()).filter(|&u| units[u].end <= a).collect();
                let after = (0..units.len()).filter(|&u| units[u].start > a).collect();
                (before, after)
            }
            None => (Vec::new(), (0..units.len()).collect()),
        };

        let mut keep = vec![true; units.len()];
        let mut dropped = 0;
        for u in before.into_iter().chain(after) {
            if total <= budget {
                break;
            }
            let range = units[u].clone();
            total -= costs[range.clone()].iter().sum::<usize>();
            dropped += range.len();
            keep[u] = false;
        }

        let trimmed: Vec<Message> = units
            .iter()
            .zip(&keep)
            .filter(|(_, k)| **k)
            .flat_map(|(range, _)| messages[range.clone()].iter().cloned())
            .collect();

        debug!(
            dropped,
            kept = trimmed.len(),
            tokens = total,
            budget,
            "Trimmed context window"
        );

        TrimOutcome {
            messages: trimmed,
            dropped,
            tokens: total,
            budget,
        }
    }
}

/// Split messages into removal units.
///
/// An assistant message with tool calls absorbs the tool messages directly
/// following it whose `tool_call_id` it requested.
fn group_units(messages: &[Message]) -> Vec<Range<usize>> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let start = i;
        i += 1;
        if messages[start].has_tool_calls() {
            let ids = &messages[start].tool_calls;
            while i < messages.len()
                && messages[i].role == Role::Tool
                && messages[i]
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| ids.iter().any(|tc| tc.id == id))
            {
                i += 1;
            }
        }
        units.push(start..i);
    }
    units
}
