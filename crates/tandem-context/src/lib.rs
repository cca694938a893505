//! Token estimation and cache-breakpoint placement.
//!
//! The transport layer does not preserve cache annotations across calls, so
//! the controller owns an explicit side-table of breakpoint indices and
//! re-applies it before every model call. Annotations must land at
//! byte-identical positions across calls to produce cache hits; recomputing
//! from the side-table avoids silent invalidation from upstream
//! non-determinism.

use serde::{Deserialize, Serialize};
use tandem_core::ChatMessage;

/// Per-message framing overhead (role tag, delimiters).
const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// Rough BPE token count for a text fragment. Splits on whitespace, then
/// weighs each word by character class: short alphabetic words are a single
/// token, long identifiers and paths cost roughly one token per four
/// characters, digit runs one per three, and non-ASCII text one per
/// character.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let mut tokens = 0u64;
    for word in text.split_whitespace() {
        let len = word.len();
        if word.bytes().all(|b| b.is_ascii_alphabetic()) {
            tokens += match len {
                0..=6 => 1,
                7..=12 => 2,
                _ => (len as u64).div_ceil(4),
            };
        } else if word.bytes().all(|b| b.is_ascii_digit()) {
            tokens += (len as u64).div_ceil(3);
        } else if word.is_ascii() {
            let punct = word.bytes().filter(|b| b.is_ascii_punctuation()).count() as u64;
            let rest = (len as u64).saturating_sub(punct);
            tokens += punct + rest.div_ceil(4).max(u64::from(rest > 0));
        } else {
            tokens += word.chars().count() as u64;
        }
    }
    // Whitespace gaps roughly one token per run; fold into word count.
    tokens.max(1)
}

#[must_use]
pub fn estimate_message_tokens(message: &ChatMessage) -> u64 {
    MESSAGE_OVERHEAD_TOKENS
        + match message {
            ChatMessage::System { content } | ChatMessage::User { content } => {
                estimate_tokens(content)
            }
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                let text = content.as_deref().map(estimate_tokens).unwrap_or(0);
                let calls: u64 = tool_calls
                    .iter()
                    .map(|tc| estimate_tokens(&tc.name) + estimate_tokens(&tc.arguments.to_string()))
                    .sum();
                text + calls
            }
            ChatMessage::Tool { content, .. } => estimate_tokens(content),
        }
}

/// The annotation plan for one outgoing model call: every index in
/// `breakpoints` gets a cache-control marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePlan {
    pub breakpoints: Vec<usize>,
    /// Index newly marked by this call, if the budget tripped.
    pub newly_marked: Option<usize>,
}

/// Tracks tokens accumulated since the last cache breakpoint and decides
/// where the next marker goes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheBudget {
    threshold_tokens: u64,
    breakpoints: Vec<usize>,
}

impl CacheBudget {
    #[must_use]
    pub fn new(threshold_tokens: u64) -> Self {
        Self {
            threshold_tokens,
            breakpoints: Vec::new(),
        }
    }

    #[must_use]
    pub fn breakpoints(&self) -> &[usize] {
        &self.breakpoints
    }

    /// Compute the annotation plan for the outgoing message list: re-apply
    /// recorded breakpoints, count tokens after the last one, and if the
    /// accumulated count meets the threshold, mark the last eligible message
    /// (assistant or tool preferred) and record it.
    pub fn annotate(&mut self, messages: &[ChatMessage]) -> CachePlan {
        // Positions can only reference messages that still exist; a shrunk
        // list (compaction) drops stale entries.
        self.breakpoints.retain(|&i| i < messages.len());

        let tail_start = self.breakpoints.iter().max().map_or(0, |&i| i + 1);
        let accumulated: u64 = messages[tail_start..]
            .iter()
            .map(estimate_message_tokens)
            .sum();

        let mut newly_marked = None;
        if accumulated >= self.threshold_tokens
            && let Some(index) = last_eligible_index(messages, tail_start)
        {
            self.breakpoints.push(index);
            self.breakpoints.sort_unstable();
            self.breakpoints.dedup();
            newly_marked = Some(index);
        }

        CachePlan {
            breakpoints: self.breakpoints.clone(),
            newly_marked,
        }
    }

    /// Forget everything — used when the conversation is rebuilt from a
    /// compaction summary and indices no longer line up.
    pub fn reset(&mut self) {
        self.breakpoints.clear();
    }
}

/// Prefer the last assistant or tool message in the tail; fall back to the
/// last message of any role.
fn last_eligible_index(messages: &[ChatMessage], tail_start: usize) -> Option<usize> {
    let preferred = messages
        .iter()
        .enumerate()
        .skip(tail_start)
        .rev()
        .find(|(_, m)| matches!(m, ChatMessage::Assistant { .. } | ChatMessage::Tool { .. }))
        .map(|(i, _)| i);
    preferred.or_else(|| {
        if messages.len() > tail_start {
            Some(messages.len() - 1)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_assistant(words: usize) -> ChatMessage {
        ChatMessage::assistant_text(
            (0..words)
                .map(|i| format!("identifier_number_{i}"))
                .collect::<Vec<_>>()
                .join(" "),
        )
    }

    #[test]
    fn estimator_scales_with_content() {
        assert_eq!(estimate_tokens(""), 0);
        assert!(estimate_tokens("hello") <= 2);
        let short = estimate_tokens("a quick look");
        let long = estimate_tokens(&"some_long_identifier::with::paths ".repeat(50));
        assert!(long > short * 10);
    }

    #[test]
    fn no_marker_below_threshold() {
        let mut budget = CacheBudget::new(1_000_000);
        let messages = vec![ChatMessage::user("hi"), long_assistant(10)];
        let plan = budget.annotate(&messages);
        assert!(plan.breakpoints.is_empty());
        assert_eq!(plan.newly_marked, None);
    }

    #[test]
    fn marker_lands_on_last_assistant_or_tool_message() {
        let mut budget = CacheBudget::new(50);
        let messages = vec![
            ChatMessage::user("question"),
            long_assistant(40),
            ChatMessage::user("follow-up"),
        ];
        let plan = budget.annotate(&messages);
        // Index 1 is the last assistant/tool message.
        assert_eq!(plan.newly_marked, Some(1));
        assert_eq!(plan.breakpoints, vec![1]);
    }

    #[test]
    fn breakpoints_are_stable_across_repeated_calls() {
        let mut budget = CacheBudget::new(50);
        let mut messages = vec![ChatMessage::user("question"), long_assistant(40)];
        let first = budget.annotate(&messages);
        assert_eq!(first.newly_marked, Some(1));

        // Same list again: same positions, no new marker (tail is empty).
        let second = budget.annotate(&messages);
        assert_eq!(second.breakpoints, first.breakpoints);
        assert_eq!(second.newly_marked, None);

        // Growth below the threshold keeps positions unchanged.
        messages.push(ChatMessage::user("small follow-up"));
        let third = budget.annotate(&messages);
        assert_eq!(third.breakpoints, first.breakpoints);
    }

    #[test]
    fn counter_resets_at_each_breakpoint() {
        let mut budget = CacheBudget::new(50);
        let mut messages = vec![long_assistant(40)];
        assert_eq!(budget.annotate(&messages).newly_marked, Some(0));

        messages.push(long_assistant(40));
        let plan = budget.annotate(&messages);
        assert_eq!(plan.newly_marked, Some(1));
        assert_eq!(plan.breakpoints, vec![0, 1]);
    }

    #[test]
    fn stale_indices_are_dropped_after_list_shrinks() {
        let mut budget = CacheBudget::new(10);
        let messages = vec![long_assistant(40), long_assistant(40)];
        budget.annotate(&messages);
        budget.annotate(&messages);
        assert!(!budget.breakpoints().is_empty());

        let shrunk = vec![ChatMessage::user("fresh start")];
        let plan = budget.annotate(&shrunk);
        assert!(plan.breakpoints.iter().all(|&i| i < shrunk.len()));
    }
}
