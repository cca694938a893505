use anyhow::{anyhow, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tandem_core::{
    CheckpointSource, FileChangeSummary, Result, UNDO_CHECKPOINT_FILE, UndoCheckpointSummary,
    normalize_path, sha256_hex,
};
use uuid::Uuid;

mod line_diff;

pub use line_diff::diff_line_counts;

const UNDO_STORE_VERSION: u32 = 1;

/// Default bound on the restorable stack; oldest checkpoints are evicted
/// beyond it.
pub const DEFAULT_STACK_LIMIT: usize = 25;

/// Pre-edit state of a single file, captured before the first change of a
/// run touches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileBeforeState {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Project-relative path, forward slashes.
    pub path: String,
    pub before: FileBeforeState,
    /// Hash of the post-run content; empty string when the run deleted the
    /// file. Conflict detection compares the current hash against this.
    pub after_hash: String,
    pub added_lines: u64,
    pub deleted_lines: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUndoCheckpoint {
    pub checkpoint_id: Uuid,
    pub source: CheckpointSource,
    pub created_at: chrono::DateTime<Utc>,
    pub files: Vec<CheckpointFile>,
    pub undoable: bool,
}

impl StoredUndoCheckpoint {
    #[must_use]
    pub fn summary(&self) -> UndoCheckpointSummary {
        UndoCheckpointSummary {
            checkpoint_id: self.checkpoint_id,
            source: self.source,
            created_at: self.created_at,
            files: self
                .files
                .iter()
                .map(|f| FileChangeSummary {
                    path: f.path.clone(),
                    added_lines: f.added_lines,
                    deleted_lines: f.deleted_lines,
                })
                .collect(),
            undoable: self.undoable,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UndoStoreFile {
    version: u32,
    checkpoints: Vec<StoredUndoCheckpoint>,
}

#[derive(Debug)]
struct PendingRun {
    checkpoint_id: Uuid,
    source: CheckpointSource,
    captured: BTreeMap<String, FileBeforeState>,
}

#[derive(thiserror::Error, Debug)]
pub enum UndoError {
    #[error("no undoable checkpoint available")]
    NoCheckpoint,
    #[error("{} file(s) were modified after the checkpoint: {}", .0.len(), .0.join(", "))]
    Conflicts(Vec<String>),
}

/// Captures pre-edit snapshots for one agent run at a time and maintains a
/// bounded stack of restorable checkpoints for the session.
///
/// The stack file is read-modify-written whole; callers must not interleave
/// two concurrent commits for the same session.
pub struct UndoCheckpointManager {
    project_root: PathBuf,
    store_path: PathBuf,
    stack_limit: usize,
    pending: Option<PendingRun>,
}

impl UndoCheckpointManager {
    pub fn new(project_root: &Path, session_storage_dir: &Path) -> Self {
        Self {
            project_root: normalize_path(project_root),
            store_path: session_storage_dir.join(UNDO_CHECKPOINT_FILE),
            stack_limit: DEFAULT_STACK_LIMIT,
            pending: None,
        }
    }

    #[must_use]
    pub fn with_stack_limit(mut self, limit: usize) -> Self {
        self.stack_limit = limit.max(1);
        self
    }

    /// Open a fresh pending checkpoint. Any previous pending run is
    /// abandoned, matching the discard-then-begin retry flow.
    pub fn begin_run(&mut self, source: CheckpointSource) {
        self.pending = Some(PendingRun {
            checkpoint_id: Uuid::now_v7(),
            source,
            captured: BTreeMap::new(),
        });
    }

    #[must_use]
    pub fn has_pending_run(&self) -> bool {
        self.pending.is_some()
    }

    /// Record the pre-edit state of a path, exactly once per run. Later
    /// calls for the same path are no-ops, so the snapshot always reflects
    /// the state before *any* change in this run.
    pub fn capture_before_change(&mut self, path: &str) -> Result<()> {
        let relative = self.validate_path(path)?;
        let absolute = self.project_root.join(&relative);
        let Some(pending) = self.pending.as_mut() else {
            bail!("capture_before_change called with no pending run");
        };
        if pending.captured.contains_key(&relative) {
            return Ok(());
        }
        let before = match fs::read_to_string(&absolute) {
            Ok(content) => FileBeforeState {
                exists: true,
                content_hash: Some(sha256_hex(content.as_bytes())),
                content: Some(content),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => FileBeforeState {
                exists: false,
                content: None,
                content_hash: None,
            },
            Err(err) => return Err(err.into()),
        };
        pending.captured.insert(relative, before);
        Ok(())
    }

    /// Close the pending run: diff every captured file against its current
    /// content, drop the unchanged ones, and push a checkpoint onto the
    /// stack. A run with zero changed files persists nothing.
    pub fn commit_run(&mut self) -> Result<Option<UndoCheckpointSummary>> {
        let Some(pending) = self.pending.take() else {
            return Ok(None);
        };

        let mut files = Vec::new();
        for (relative, before) in pending.captured {
            let absolute = self.project_root.join(&relative);
            let after_content = match fs::read_to_string(&absolute) {
                Ok(content) => Some(content),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
                Err(err) => return Err(err.into()),
            };
            let after_hash = after_content
                .as_deref()
                .map(|c| sha256_hex(c.as_bytes()))
                .unwrap_or_default();

            let unchanged = match (&before.content_hash, after_content.as_deref()) {
                (Some(before_hash), Some(_)) => *before_hash == after_hash,
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                continue;
            }

            let before_text = before.content.as_deref().unwrap_or("");
            let after_text = after_content.as_deref().unwrap_or("");
            let (added_lines, deleted_lines) = diff_line_counts(before_text, after_text);
            files.push(CheckpointFile {
                path: relative,
                before,
                after_hash,
                added_lines,
                deleted_lines,
            });
        }

        if files.is_empty() {
            return Ok(None);
        }

        let checkpoint = StoredUndoCheckpoint {
            checkpoint_id: pending.checkpoint_id,
            source: pending.source,
            created_at: Utc::now(),
            files,
            undoable: true,
        };

        let mut stack = self.load_stack()?;
        stack.push(checkpoint);
        while stack.len() > self.stack_limit {
            stack.remove(0);
        }
        mark_undoable_top(&mut stack);
        self.write_stack(&stack)?;
        Ok(stack.last().map(StoredUndoCheckpoint::summary))
    }

    /// Abandon the pending run without persisting anything.
    pub fn discard_pending_run(&mut self) {
        self.pending = None;
    }

    /// Top of the stack, with `undoable` normalized so only the newest
    /// checkpoint advertises undo.
    pub fn latest_checkpoint(&self) -> Result<Option<StoredUndoCheckpoint>> {
        let mut stack = self.load_stack()?;
        mark_undoable_top(&mut stack);
        Ok(stack.pop())
    }

    pub fn checkpoints(&self) -> Result<Vec<StoredUndoCheckpoint>> {
        let mut stack = self.load_stack()?;
        mark_undoable_top(&mut stack);
        Ok(stack)
    }

    /// Files whose current content no longer matches the checkpoint's
    /// recorded post-run hash — a later edit touched them, and an undo would
    /// silently overwrite that newer work.
    pub fn conflicted_files(&self, checkpoint: &StoredUndoCheckpoint) -> Result<Vec<String>> {
        let mut conflicts = Vec::new();
        for file in &checkpoint.files {
            let absolute = self.project_root.join(&file.path);
            let current_hash = match fs::read_to_string(&absolute) {
                Ok(content) => sha256_hex(content.as_bytes()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(err) => return Err(err.into()),
            };
            if current_hash != file.after_hash {
                conflicts.push(file.path.clone());
            }
        }
        Ok(conflicts)
    }

    /// Restore the latest checkpoint's before-state. Refuses when conflicted
    /// files exist unless `force` is set. Returns the restored paths.
    pub fn restore_latest(&mut self, force: bool) -> Result<Vec<String>> {
        let checkpoint = self
            .latest_checkpoint()?
            .filter(|c| c.undoable)
            .ok_or(UndoError::NoCheckpoint)?;

        if !force {
            let conflicts = self.conflicted_files(&checkpoint)?;
            if !conflicts.is_empty() {
                return Err(UndoError::Conflicts(conflicts).into());
            }
        }

        let mut restored = Vec::new();
        for file in &checkpoint.files {
            let absolute = self.project_root.join(&file.path);
            if file.before.exists {
                if let Some(parent) = absolute.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&absolute, file.before.content.as_deref().unwrap_or(""))?;
            } else if absolute.exists() {
                fs::remove_file(&absolute)?;
            }
            restored.push(file.path.clone());
        }

        self.clear_latest_checkpoint()?;
        Ok(restored)
    }

    /// Pop the top of the stack, re-marking the new top undoable. The
    /// backing file is deleted outright once the stack empties.
    pub fn clear_latest_checkpoint(&mut self) -> Result<()> {
        let mut stack = self.load_stack()?;
        if stack.pop().is_none() {
            return Ok(());
        }
        if stack.is_empty() {
            if self.store_path.exists() {
                fs::remove_file(&self.store_path)?;
            }
            return Ok(());
        }
        mark_undoable_top(&mut stack);
        self.write_stack(&stack)
    }

    /// Validate that a path lands inside the project root and outside the
    /// internal storage directory; returns the normalized relative form.
    fn validate_path(&self, path: &str) -> Result<String> {
        let candidate = Path::new(path);
        let absolute = if candidate.is_absolute() {
            normalize_path(candidate)
        } else {
            normalize_path(&self.project_root.join(candidate))
        };
        let relative = absolute
            .strip_prefix(&self.project_root)
            .map_err(|_| anyhow!("path escapes the project root: {path}"))?;
        let relative_str = relative.to_string_lossy().replace('\\', "/");
        if relative_str.is_empty() {
            bail!("path points at the project root itself: {path}");
        }
        if relative_str == ".tandem" || relative_str.starts_with(".tandem/") {
            bail!("path targets internal storage: {path}");
        }
        Ok(relative_str)
    }

    fn load_stack(&self) -> Result<Vec<StoredUndoCheckpoint>> {
        if !self.store_path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.store_path)?;
        let file: UndoStoreFile = serde_json::from_str(&raw)?;
        if file.version != UNDO_STORE_VERSION {
            bail!(
                "undo store version {} is not supported (current {})",
                file.version,
                UNDO_STORE_VERSION
            );
        }
        Ok(file.checkpoints)
    }

    fn write_stack(&self, checkpoints: &[StoredUndoCheckpoint]) -> Result<()> {
        if let Some(parent) = self.store_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = UndoStoreFile {
            version: UNDO_STORE_VERSION,
            checkpoints: checkpoints.to_vec(),
        };
        fs::write(&self.store_path, serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }
}

fn mark_undoable_top(stack: &mut [StoredUndoCheckpoint]) {
    let last = stack.len().saturating_sub(1);
    for (i, checkpoint) in stack.iter_mut().enumerate() {
        checkpoint.undoable = i == last;
    }
}
