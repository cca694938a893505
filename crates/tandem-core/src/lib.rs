use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

/// Bumped whenever the on-disk session layout changes incompatibly.
/// Sessions written by a different version are skipped on read and
/// rejected on write.
pub const STORAGE_VERSION: u32 = 1;

pub const HISTORY_FILE: &str = "history.jsonl";
pub const METADATA_FILE: &str = "metadata.json";
pub const UNDO_CHECKPOINT_FILE: &str = "undo-checkpoint.json";
pub const TOOL_RESULTS_DIR: &str = "tool-results";
pub const PLAN_DIR: &str = "plan";

// ── Storage path resolver ──────────────────────────────────────────────

/// Default storage root: `~/.tandem/projects`. Overridable through config.
pub fn default_storage_root() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".tandem").join("projects")
}

/// Lexically normalize a path: resolve `.` and `..` components without
/// touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Map a project root to its storage key: the sanitized directory basename
/// plus a truncated hash of the normalized absolute path. Human-inspectable
/// and collision-resistant at the same time.
pub fn project_key(project_root: &Path) -> String {
    let normalized = normalize_path(project_root);
    let basename = normalized
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    let sanitized: String = basename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let digest = Sha256::digest(normalized.to_string_lossy().as_bytes());
    let hash_hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{sanitized}-{}", &hash_hex[..12])
}

/// Per-project storage directory under the storage root.
pub fn project_dir(storage_root: &Path, project_root: &Path) -> PathBuf {
    storage_root.join(project_key(project_root))
}

/// Per-session storage directory.
pub fn session_dir(storage_root: &Path, project_root: &Path, session_id: Uuid) -> PathBuf {
    project_dir(storage_root, project_root).join(session_id.to_string())
}

/// Plan-mode writable directory for a session.
pub fn plan_dir(storage_root: &Path, project_root: &Path, session_id: Uuid) -> PathBuf {
    session_dir(storage_root, project_root, session_id).join(PLAN_DIR)
}

// ── Agent mode ─────────────────────────────────────────────────────────

/// Capability restriction applied to tool execution for the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Ask,
    Plan,
    Edit,
}

impl AgentMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ask => "ask",
            Self::Plan => "plan",
            Self::Edit => "edit",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ask" => Some(Self::Ask),
            "plan" => Some(Self::Plan),
            "edit" => Some(Self::Edit),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Chat messages ──────────────────────────────────────────────────────

/// A tool call requested by the model within an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A message in a multi-turn conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<ToolCallRequest>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    #[must_use]
    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }
}

// ── Tool names ─────────────────────────────────────────────────────────

/// Type-safe tool name enum covering all built-in tools.
/// External/plugin tools are not represented; `from_api_name` returns
/// `None` for unknown names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    FileRead,
    FileWrite,
    FileEdit,
    MultiEdit,
    Grep,
    Glob,
    ShellRun,
    KillShell,
    ValidateCode,
    BuildProject,
    AskUser,
    EnterPlanMode,
    ExitPlanMode,
    TaskWrite,
}

impl ToolName {
    #[must_use]
    pub fn from_api_name(s: &str) -> Option<Self> {
        Some(match s {
            "file_read" => Self::FileRead,
            "file_write" => Self::FileWrite,
            "file_edit" => Self::FileEdit,
            "multi_edit" => Self::MultiEdit,
            "grep" => Self::Grep,
            "glob" => Self::Glob,
            "shell_run" => Self::ShellRun,
            "kill_shell" => Self::KillShell,
            "validate_code" => Self::ValidateCode,
            "build_project" => Self::BuildProject,
            "ask_user" => Self::AskUser,
            "enter_plan_mode" => Self::EnterPlanMode,
            "exit_plan_mode" => Self::ExitPlanMode,
            "task_write" => Self::TaskWrite,
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_api_name(&self) -> &'static str {
        match self {
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::FileEdit => "file_edit",
            Self::MultiEdit => "multi_edit",
            Self::Grep => "grep",
            Self::Glob => "glob",
            Self::ShellRun => "shell_run",
            Self::KillShell => "kill_shell",
            Self::ValidateCode => "validate_code",
            Self::BuildProject => "build_project",
            Self::AskUser => "ask_user",
            Self::EnterPlanMode => "enter_plan_mode",
            Self::ExitPlanMode => "exit_plan_mode",
            Self::TaskWrite => "task_write",
        }
    }

    /// Whether this tool only observes the project (allowed in ask mode).
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::FileRead
                | Self::Grep
                | Self::Glob
                | Self::ValidateCode
                | Self::AskUser
                | Self::EnterPlanMode
                | Self::ExitPlanMode
                | Self::TaskWrite
        )
    }

    /// Whether this tool writes file content (triggers undo capture).
    #[must_use]
    pub fn modifies_files(&self) -> bool {
        matches!(self, Self::FileWrite | Self::FileEdit | Self::MultiEdit)
    }

    pub const ALL: &'static [ToolName] = &[
        Self::FileRead,
        Self::FileWrite,
        Self::FileEdit,
        Self::MultiEdit,
        Self::Grep,
        Self::Glob,
        Self::ShellRun,
        Self::KillShell,
        Self::ValidateCode,
        Self::BuildProject,
        Self::AskUser,
        Self::EnterPlanMode,
        Self::ExitPlanMode,
        Self::TaskWrite,
    ];
}

// ── Plans and tasks ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Review,
    Done,
    Rejected,
}

impl TaskStatus {
    /// Terminal statuses never need to reappear in a task-list update.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Rejected)
    }
}

/// One unit of plan work. Identity is the description string, so task-list
/// updates must always carry the complete list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    pub status: TaskStatus,
    #[serde(rename = "type", default)]
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    pub tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    #[must_use]
    pub fn new(tasks: Vec<Task>) -> Self {
        let now = Utc::now();
        Self {
            plan_id: Uuid::now_v7(),
            tasks,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }
}

// ── Undo checkpoint summary (journal-facing view) ──────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    Agent,
    CodeSegment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChangeSummary {
    pub path: String,
    pub added_lines: u64,
    pub deleted_lines: u64,
}

/// Compact view of a committed undo checkpoint, recorded in the journal
/// and shown in the UI. The restorable file contents live in the undo store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoCheckpointSummary {
    pub checkpoint_id: Uuid,
    pub source: CheckpointSource,
    pub created_at: DateTime<Utc>,
    pub files: Vec<FileChangeSummary>,
    pub undoable: bool,
}

// ── Diagnostics ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub path: String,
    pub line: u32,
    pub severity: DiagnosticSeverity,
    pub message: String,
}

// ── UI events ──────────────────────────────────────────────────────────

/// Events delivered to the embedding UI layer. One discriminant tag plus
/// tag-specific payload; adding a kind is a compile-time-checked change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    Start,
    ContentBlock {
        content: String,
    },
    ContentReplace {
        content: String,
    },
    ToolCall {
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        loading_action: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        display_input: Option<serde_json::Value>,
    },
    ToolResult {
        tool_name: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        completed_action: Option<String>,
    },
    Error {
        error: String,
    },
    Diagnostics {
        diagnostics: Vec<Diagnostic>,
    },
    Stop {
        modified_files: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_input_tokens: Option<u64>,
    },
    TaskApprovalRequest {
        request_id: Uuid,
        task_description: String,
        task_index: usize,
    },
    PlanApprovalRequested {
        request_id: Uuid,
        plan_file: String,
    },
    UndoCheckpoint {
        checkpoint: UndoCheckpointSummary,
    },
    CompactSummary {
        summary: String,
    },
}

// ── Cancellation ───────────────────────────────────────────────────────

/// Cloneable abort token threaded through the run loop and tool execution.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ── Configuration ──────────────────────────────────────────────────────

fn default_auto_compact_threshold() -> u64 {
    180_000
}
fn default_cache_budget_threshold() -> u64 {
    8_000
}
fn default_oversized_result_chars() -> usize {
    20_000
}
fn default_undo_stack_limit() -> usize {
    25
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Auto-compact once the last recorded usage reaches this many tokens.
    pub auto_compact_threshold_tokens: u64,
    /// Insert a cache breakpoint after this many accumulated tokens.
    pub cache_budget_threshold_tokens: u64,
    /// Persist tool results larger than this to a side file.
    pub oversized_result_chars: usize,
    /// Maximum number of restorable undo checkpoints per session.
    pub undo_stack_limit: usize,
    /// Override the storage root (defaults to `~/.tandem/projects`).
    pub storage_root: Option<String>,
    pub telemetry: TelemetryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            auto_compact_threshold_tokens: default_auto_compact_threshold(),
            cache_budget_threshold_tokens: default_cache_budget_threshold(),
            oversized_result_chars: default_oversized_result_chars(),
            undo_stack_limit: default_undo_stack_limit(),
            storage_root: None,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".tandem").join("settings.json"))
    }

    pub fn project_settings_path(project_root: &Path) -> PathBuf {
        project_root.join(".tandem").join("settings.json")
    }

    pub fn project_local_settings_path(project_root: &Path) -> PathBuf {
        project_root.join(".tandem").join("settings.local.json")
    }

    /// Layered load: defaults, then user settings, then project settings,
    /// then project-local settings, deep-merged in that order.
    pub fn load(project_root: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(project_root));
        paths.push(Self::project_local_settings_path(project_root));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let overlay: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json(&mut merged, &overlay);
        }

        Ok(serde_json::from_value(merged)?)
    }

    #[must_use]
    pub fn storage_root_path(&self) -> PathBuf {
        self.storage_root
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_storage_root)
    }
}

fn merge_json(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

// ── String helpers shared across crates ────────────────────────────────

/// Truncate at a char boundary at or below `max_bytes`.
#[must_use]
pub fn truncate_chars(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Hex-encoded SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_key_is_deterministic_and_sanitized() {
        let a = project_key(Path::new("/home/dev/my project!"));
        let b = project_key(Path::new("/home/dev/my project!"));
        assert_eq!(a, b);
        assert!(a.starts_with("my-project--"));
        let (_, hash) = a.rsplit_once('-').expect("hash suffix");
        assert_eq!(hash.len(), 12);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn project_key_distinguishes_same_basename() {
        let a = project_key(Path::new("/home/alice/app"));
        let b = project_key(Path::new("/home/bob/app"));
        assert_ne!(a, b);
    }

    #[test]
    fn normalize_path_resolves_dot_components() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }

    #[test]
    fn mode_round_trips_through_parse() {
        for mode in [AgentMode::Ask, AgentMode::Plan, AgentMode::Edit] {
            assert_eq!(AgentMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(AgentMode::parse("yolo"), None);
    }

    #[test]
    fn tool_names_round_trip_and_classify() {
        for name in ToolName::ALL {
            assert_eq!(ToolName::from_api_name(name.as_api_name()), Some(*name));
        }
        assert!(ToolName::FileRead.is_read_only());
        assert!(!ToolName::FileWrite.is_read_only());
        assert!(ToolName::MultiEdit.modifies_files());
        assert!(!ToolName::ShellRun.modifies_files());
    }

    #[test]
    fn config_layers_merge_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let project = dir.path().join("proj");
        fs::create_dir_all(project.join(".tandem")).expect("mkdir");
        fs::write(
            AppConfig::project_settings_path(&project),
            r#"{"auto_compact_threshold_tokens": 1000, "telemetry": {"enabled": true}}"#,
        )
        .expect("project settings");
        fs::write(
            AppConfig::project_local_settings_path(&project),
            r#"{"auto_compact_threshold_tokens": 500}"#,
        )
        .expect("local settings");

        let cfg = AppConfig::load(&project).expect("load");
        assert_eq!(cfg.auto_compact_threshold_tokens, 500);
        assert!(cfg.telemetry.enabled);
        assert_eq!(cfg.undo_stack_limit, 25);
    }

    #[test]
    fn truncate_chars_respects_boundaries() {
        let s = "héllo wörld";
        let cut = truncate_chars(s, 2);
        assert!(cut.len() <= 2);
        assert!(s.starts_with(cut));
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn chat_message_serializes_with_role_tag() {
        let msg = ChatMessage::Assistant {
            content: Some("done".to_string()),
            tool_calls: vec![],
        };
        let json = serde_json::to_value(&msg).expect("json");
        assert_eq!(json["role"], "assistant");
        assert!(json.get("tool_calls").is_none());
    }
}
