//! Conversation compaction.
//!
//! Compaction happens between runs, never mid-stream. The summarizer is
//! pluggable — an LLM-backed implementation lives at the embedding layer —
//! with a deterministic extractive fallback that never fails.

use serde_json::Value;
use std::collections::BTreeMap;
use tandem_core::{AppConfig, ChatMessage, Result, ToolName, truncate_chars};
use tandem_store::{JournalEntry, JournalStore, MessageOptions};

/// Produces the summary text recorded at a compaction checkpoint.
pub trait Summarizer {
    fn summarize(&self, entries: &[JournalEntry]) -> Result<String>;
}

/// Code-only fallback: extracts modified/read files, errors encountered,
/// notable assistant statements, and tool usage counts from the journal
/// view. Deterministic, no model call.
pub struct ExtractiveSummarizer;

impl Summarizer for ExtractiveSummarizer {
    fn summarize(&self, entries: &[JournalEntry]) -> Result<String> {
        let mut files_modified: Vec<String> = Vec::new();
        let mut files_read: Vec<String> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        let mut notes: Vec<String> = Vec::new();
        let mut tool_counts: BTreeMap<String, usize> = BTreeMap::new();

        for entry in entries {
            match &entry.message {
                Some(ChatMessage::Assistant {
                    content,
                    tool_calls,
                }) => {
                    for call in tool_calls {
                        *tool_counts.entry(call.name.clone()).or_default() += 1;
                        if let Some(path) = call
                            .arguments
                            .get("file_path")
                            .or_else(|| call.arguments.get("path"))
                            .and_then(Value::as_str)
                        {
                            let writes = ToolName::from_api_name(&call.name)
                                .is_some_and(|t| t.modifies_files());
                            if writes {
                                files_modified.push(path.to_string());
                            } else {
                                files_read.push(path.to_string());
                            }
                        }
                    }
                    if let Some(text) = content
                        && (50..500).contains(&text.len())
                    {
                        notes.push(first_line(text, 150));
                    }
                }
                Some(ChatMessage::Tool { content, .. }) => {
                    let lower = content.to_ascii_lowercase();
                    if lower.contains("error") || lower.contains("failed") {
                        errors.push(first_line(content, 100));
                    }
                }
                _ => {}
            }
        }

        files_modified.sort();
        files_modified.dedup();
        files_read.sort();
        files_read.dedup();

        let mut summary = String::new();
        if !files_modified.is_empty() {
            summary.push_str(&format!("Files modified: {}\n", files_modified.join(", ")));
        }
        if !files_read.is_empty() {
            summary.push_str(&format!("Files read: {}\n", files_read.join(", ")));
        }
        if !errors.is_empty() {
            summary.push_str(&format!("Errors encountered: {}\n", errors.join("; ")));
        }
        if !notes.is_empty() {
            summary.push_str("Key statements:\n");
            for note in notes.iter().take(5) {
                summary.push_str(&format!("- {note}\n"));
            }
        }
        if !tool_counts.is_empty() {
            let counts = tool_counts
                .iter()
                .map(|(name, count)| format!("{name}x{count}"))
                .collect::<Vec<_>>()
                .join(", ");
            summary.push_str(&format!("Tools used: {counts}\n"));
        }
        if summary.is_empty() {
            summary.push_str("No substantive activity recorded.\n");
        }
        Ok(summary)
    }
}

fn first_line(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or(text);
    let cut = truncate_chars(line, max_chars);
    if cut.len() < line.len() {
        format!("{cut}...")
    } else {
        cut.to_string()
    }
}

/// Compact when the last recorded usage meets the configured threshold.
/// Returns whether a checkpoint was written.
pub fn auto_compact_if_needed(
    journal: &mut JournalStore,
    cfg: &AppConfig,
    summarizer: &dyn Summarizer,
) -> Result<bool> {
    let Some(usage) = journal.last_usage()? else {
        return Ok(false);
    };
    if usage < cfg.auto_compact_threshold_tokens {
        return Ok(false);
    }
    compact_now(journal, summarizer)
}

/// Unconditionally compact (explicit user action or context-error recovery).
pub fn compact_now(journal: &mut JournalStore, summarizer: &dyn Summarizer) -> Result<bool> {
    let entries = journal.messages(MessageOptions {
        include_compact_summary_entry: true,
        include_undo_checkpoint_entry: false,
    })?;
    if entries.is_empty() {
        return Ok(false);
    }
    let summary = summarizer.summarize(&entries)?;
    journal.save_summary_message(&summary)?;
    Ok(true)
}

/// Detect context-window exhaustion from provider error text. These errors
/// are suppressed once, the conversation compacted, and the run retried.
#[must_use]
pub fn is_context_limit_error(message: &str) -> bool {
    let normalized = message.to_ascii_lowercase();
    [
        "context window",
        "context length",
        "maximum context length",
        "prompt is too long",
        "input is too long",
        "too many tokens",
        "max input tokens",
    ]
    .iter()
    .any(|needle| normalized.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::AgentMode;
    use tandem_testkit::TempProject;

    fn seeded_journal(project: &TempProject) -> JournalStore {
        let mut journal =
            JournalStore::create(&project.storage_root, &project.project_root).expect("create");
        journal.record_user("add an endpoint", Some(1)).expect("user");
        journal
            .record_assistant(
                ChatMessage::Assistant {
                    content: None,
                    tool_calls: vec![tandem_core::ToolCallRequest {
                        id: "c1".to_string(),
                        name: "file_write".to_string(),
                        arguments: serde_json::json!({"file_path": "src/api.bal"}),
                    }],
                },
                Some(1),
                None,
            )
            .expect("assistant");
        journal
            .record_tool("c1", r#"{"success":true}"#, Some(1))
            .expect("tool");
        journal
    }

    #[test]
    fn extractive_summary_names_modified_files_and_tools() {
        let project = TempProject::new().expect("project");
        let journal = seeded_journal(&project);
        let entries = journal.messages(MessageOptions::default()).expect("view");
        let summary = ExtractiveSummarizer.summarize(&entries).expect("summary");
        assert!(summary.contains("src/api.bal"));
        assert!(summary.contains("file_writex1"));
    }

    #[test]
    fn auto_compact_respects_threshold_and_resets_usage_view() {
        let project = TempProject::new().expect("project");
        let mut journal = seeded_journal(&project);
        let cfg = AppConfig {
            auto_compact_threshold_tokens: 1_000,
            ..AppConfig::default()
        };

        // Below threshold: nothing happens.
        journal
            .record_assistant(ChatMessage::assistant_text("done"), Some(1), Some(500))
            .expect("assistant");
        assert!(!auto_compact_if_needed(&mut journal, &cfg, &ExtractiveSummarizer).expect("check"));

        // Above threshold: compaction writes a checkpoint and the usage
        // scan stops at it, so a second pass does not re-trigger.
        journal
            .record_assistant(ChatMessage::assistant_text("more"), Some(2), Some(2_000))
            .expect("assistant");
        assert!(auto_compact_if_needed(&mut journal, &cfg, &ExtractiveSummarizer).expect("compact"));
        assert!(!auto_compact_if_needed(&mut journal, &cfg, &ExtractiveSummarizer).expect("again"));
        assert_eq!(
            journal.latest_mode(AgentMode::Edit).expect("mode"),
            AgentMode::Edit
        );
    }

    #[test]
    fn context_limit_detection_matches_provider_phrasings() {
        assert!(is_context_limit_error("Prompt is too long: 210000 tokens"));
        assert!(is_context_limit_error(
            "This model's maximum context length is 200000 tokens"
        ));
        assert!(!is_context_limit_error("rate limit exceeded"));
    }
}
