//! Context Accounting
//!
//! Token estimation for the session's context-size reporting and the
//! transcript-side truncation of oversized tool output.

use serde::{Deserialize, Serialize};

use crate::types::{ContentPart, Message};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Context-management limits from config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextLimits {
    /// Recent tokens never pruned during compaction.
    #[serde(default = "default_prune_protect")]
    pub prune_protect_tokens: usize,
    /// Context size below which pruning never runs.
    #[serde(default = "default_prune_minimum")]
    pub prune_minimum_tokens: usize,
    /// Max lines of one tool output kept in the transcript.
    #[serde(default = "default_truncate_lines")]
    pub truncate_max_lines: usize,
    /// Max bytes of one tool output kept in the transcript.
    #[serde(default = "default_truncate_bytes")]
    pub truncate_max_bytes: usize,
}

fn default_prune_protect() -> usize {
    40_000
}
fn default_prune_minimum() -> usize {
    20_000
}
fn default_truncate_lines() -> usize {
    1000
}
fn default_truncate_bytes() -> usize {
    50_000
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            prune_protect_tokens: default_prune_protect(),
            prune_minimum_tokens: default_prune_minimum(),
            truncate_max_lines: default_truncate_lines(),
            truncate_max_bytes: default_truncate_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Token estimation
// ---------------------------------------------------------------------------

/// Rough token estimate: chars / 4, rounded up. Providers with exact
/// tokenizers report real usage through `FinishStep`; this estimate
/// only drives the context display.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

fn part_chars(part: &ContentPart) -> usize {
    match part {
        ContentPart::Text { text } => text.len(),
        ContentPart::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
        ContentPart::ToolResult { content, .. } => content.len(),
        ContentPart::Image { data, .. } => data.len(),
    }
}

pub fn estimate_message_tokens(message: &Message) -> usize {
    message
        .parts
        .iter()
        .map(|p| part_chars(p).div_ceil(4))
        .sum()
}

pub fn estimate_transcript_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

// ---------------------------------------------------------------------------
// Output truncation
// ---------------------------------------------------------------------------

/// Truncate tool output for the transcript, keeping the head and
/// noting how much was dropped.
pub fn truncate_output(content: &str, limits: &ContextLimits) -> String {
    let total_lines = content.lines().count();
    let over_lines = total_lines > limits.truncate_max_lines;
    let over_bytes = content.len() > limits.truncate_max_bytes;

    if !over_lines && !over_bytes {
        return content.to_string();
    }

    let mut kept = String::new();
    for line in content.lines().take(limits.truncate_max_lines) {
        if kept.len() + line.len() + 1 > limits.truncate_max_bytes {
            break;
        }
        kept.push_str(line);
        kept.push('\n');
    }

    let kept_lines = kept.lines().count();
    kept.push_str(&format!(
        "... [output truncated: {} of {} lines shown]",
        kept_lines, total_lines
    ));
    kept
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn transcript_estimate_sums_messages() {
        let messages = vec![Message::user("aaaa"), Message::user("bbbb")];
        assert_eq!(estimate_transcript_tokens(&messages), 2);
    }

    #[test]
    fn tool_parts_counted() {
        let msg = Message::new(
            Role::Assistant,
            vec![ContentPart::ToolUse {
                id: "t1".into(),
                name: "read".into(),
                input: serde_json::json!({"path": "src/main.rs"}),
            }],
        );
        assert!(estimate_message_tokens(&msg) > 0);
    }

    #[test]
    fn truncate_noop_when_small() {
        let limits = ContextLimits::default();
        assert_eq!(truncate_output("hello\nworld", &limits), "hello\nworld");
    }

    #[test]
    fn truncate_by_lines() {
        let limits = ContextLimits {
            truncate_max_lines: 2,
            ..Default::default()
        };
        let out = truncate_output("a\nb\nc\nd", &limits);
        assert!(out.starts_with("a\nb\n"));
        assert!(out.contains("truncated"));
        assert!(out.contains("4 lines"));
    }

    #[test]
    fn truncate_by_bytes() {
        let limits = ContextLimits {
            truncate_max_bytes: 10,
            ..Default::default()
        };
        let long_line = "x".repeat(100);
        let out = truncate_output(&format!("{long_line}\nshort"), &limits);
        assert!(out.contains("truncated"));
    }
}
