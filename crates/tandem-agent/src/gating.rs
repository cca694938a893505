//! Mode-aware tool execution wrapper.
//!
//! Every tool call passes through [`ToolGate::execute`], which composes the
//! orthogonal concerns around the raw executor: mode gating (structured
//! rejection, never an exception), undo capture before any file mutation,
//! and oversized-result persistence.

use crate::{ToolExecutor, ToolOutcome};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tandem_core::{AgentMode, Result, TOOL_RESULTS_DIR, ToolName, truncate_chars};
use tandem_policy::{ModePolicy, write_targets};
use tandem_undo::UndoCheckpointManager;
use uuid::Uuid;

const PREVIEW_CHARS: usize = 1_000;

/// Persists tool results whose serialized size exceeds the threshold to a
/// side file under `tool-results/`, replacing the inline value with a
/// truncated preview plus a pointer. Bounds the token cost of large outputs
/// without losing the data.
#[derive(Debug, Clone)]
pub struct OverflowStore {
    dir: PathBuf,
    threshold_chars: usize,
}

impl OverflowStore {
    pub fn new(session_storage_dir: &Path, threshold_chars: usize) -> Self {
        Self {
            dir: session_storage_dir.join(TOOL_RESULTS_DIR),
            threshold_chars,
        }
    }

    /// Replace an oversized output with a preview + pointer. String outputs
    /// are persisted byte-for-byte so reading the file back yields the
    /// original exactly.
    pub fn capture_if_oversized(&self, tool_name: &str, output: &Value) -> Result<Value> {
        let full_text = match output {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other)?,
        };
        if full_text.len() <= self.threshold_chars {
            return Ok(output.clone());
        }

        fs::create_dir_all(&self.dir)?;
        let file_name = format!("{}-{}.txt", tool_name, Uuid::now_v7());
        let path = self.dir.join(file_name);
        fs::write(&path, &full_text)?;

        Ok(serde_json::json!({
            "truncated": true,
            "preview": truncate_chars(&full_text, PREVIEW_CHARS),
            "full_result_path": path.to_string_lossy(),
            "original_chars": full_text.len(),
        }))
    }

    /// Drop overflow directories left behind by sessions whose journal is
    /// gone (deleted sessions).
    pub fn cleanup_orphaned(project_storage_dir: &Path) -> Result<usize> {
        let mut removed = 0;
        if !project_storage_dir.exists() {
            return Ok(0);
        }
        for entry in fs::read_dir(project_storage_dir)? {
            let session_dir = entry?.path();
            if !session_dir.is_dir() {
                continue;
            }
            let overflow = session_dir.join(TOOL_RESULTS_DIR);
            if overflow.is_dir() && !session_dir.join(tandem_core::HISTORY_FILE).exists() {
                fs::remove_dir_all(&overflow)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Per-run execution wrapper. Holds mutable access to the undo manager for
/// the duration of one agent run so the "before" snapshot is guaranteed to
/// be captured before the underlying write executes.
pub struct ToolGate<'a> {
    pub mode: AgentMode,
    pub policy: &'a ModePolicy,
    pub undo: &'a mut UndoCheckpointManager,
    pub overflow: &'a OverflowStore,
}

impl ToolGate<'_> {
    pub fn execute(
        &mut self,
        executor: &mut dyn ToolExecutor,
        name: &str,
        args: &Value,
    ) -> Result<ToolOutcome> {
        if let Err(rejection) = self.policy.check(self.mode, name, args) {
            return Ok(ToolOutcome::error(rejection.code(), rejection.to_string()));
        }
        // Policy passed, so the name is a known builtin.
        let tool = ToolName::from_api_name(name)
            .ok_or_else(|| anyhow::anyhow!("unclassified tool `{name}` passed policy"))?;

        if tool.modifies_files() {
            for target in write_targets(args) {
                // Plan files live in session storage, not in the project;
                // they are outside the undo surface.
                if self.policy.is_plan_file(&target) {
                    continue;
                }
                if let Err(err) = self.undo.capture_before_change(&target) {
                    return Ok(ToolOutcome::error("PATH_RESTRICTED", err.to_string()));
                }
            }
        }

        let mut outcome = executor.execute(tool, args);
        outcome.output = self.overflow.capture_if_oversized(name, &outcome.output)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_outputs_pass_through_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OverflowStore::new(dir.path(), 100);
        let output = serde_json::json!({"ok": true});
        let kept = store
            .capture_if_oversized("file_read", &output)
            .expect("capture");
        assert_eq!(kept, output);
        assert!(!dir.path().join(TOOL_RESULTS_DIR).exists());
    }

    #[test]
    fn oversized_string_round_trips_through_the_side_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OverflowStore::new(dir.path(), 1_000);
        let original = "x".repeat(40_000);
        let replaced = store
            .capture_if_oversized("file_read", &Value::String(original.clone()))
            .expect("capture");

        assert_eq!(replaced["truncated"], true);
        assert_eq!(replaced["original_chars"], 40_000);
        let preview = replaced["preview"].as_str().expect("preview");
        assert!(preview.len() <= PREVIEW_CHARS);

        let path = replaced["full_result_path"].as_str().expect("path");
        let read_back = fs::read_to_string(path).expect("read side file");
        assert_eq!(read_back, original);
    }

    #[test]
    fn cleanup_removes_overflow_of_dead_sessions_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let live = dir.path().join("live-session");
        let dead = dir.path().join("dead-session");
        fs::create_dir_all(live.join(TOOL_RESULTS_DIR)).expect("live");
        fs::write(live.join(tandem_core::HISTORY_FILE), "").expect("history");
        fs::create_dir_all(dead.join(TOOL_RESULTS_DIR)).expect("dead");

        let removed = OverflowStore::cleanup_orphaned(dir.path()).expect("cleanup");
        assert_eq!(removed, 1);
        assert!(live.join(TOOL_RESULTS_DIR).exists());
        assert!(!dead.join(TOOL_RESULTS_DIR).exists());
    }
}
