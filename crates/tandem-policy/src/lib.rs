//! Mode-aware tool gating.
//!
//! Ask mode allows read-only operations only. Plan mode additionally allows
//! markdown writes inside the session's plan directory and a screened subset
//! of shell commands. Edit mode is unrestricted.

use regex::Regex;
use std::path::{Path, PathBuf};
use tandem_core::{AgentMode, ToolName, normalize_path};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("tool `{tool}` is not available in ask mode; only read-only operations are allowed")]
    AskModeRestricted { tool: String },
    #[error("plan mode only permits writing markdown files inside the plan directory; `{target}` is not allowed")]
    PlanModeRestricted { target: String },
    #[error("command rejected in plan mode: {reason}")]
    PlanShellRestricted { reason: String },
    #[error("unknown tool `{tool}`")]
    UnknownTool { tool: String },
}

impl PolicyError {
    /// Stable machine-readable code surfaced in structured tool results.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AskModeRestricted { .. } => "ASK_MODE_RESTRICTED",
            Self::PlanModeRestricted { .. } => "PLAN_MODE_RESTRICTED",
            Self::PlanShellRestricted { .. } => "PLAN_SHELL_RESTRICTED",
            Self::UnknownTool { .. } => "UNKNOWN_TOOL",
        }
    }
}

/// Mutating command names (or name + verb pairs) denied in plan mode.
const PLAN_MODE_DENIED_COMMANDS: &[&[&str]] = &[
    &["rm"],
    &["rmdir"],
    &["mv"],
    &["cp"],
    &["mkdir"],
    &["touch"],
    &["chmod"],
    &["chown"],
    &["ln"],
    &["dd"],
    &["truncate"],
    &["git", "add"],
    &["git", "commit"],
    &["git", "push"],
    &["git", "pull"],
    &["git", "merge"],
    &["git", "rebase"],
    &["git", "reset"],
    &["git", "checkout"],
    &["git", "restore"],
    &["git", "stash"],
    &["npm", "install"],
    &["npm", "run"],
    &["npm", "ci"],
    &["yarn", "install"],
    &["yarn", "add"],
    &["pnpm", "install"],
    &["pnpm", "add"],
    &["pip", "install"],
    &["pip3", "install"],
    &["cargo", "build"],
    &["cargo", "run"],
    &["cargo", "install"],
    &["cargo", "add"],
    &["mvn", "install"],
    &["mvn", "package"],
    &["mvn", "deploy"],
    &["gradle", "build"],
    &["make"],
    &["apt", "install"],
    &["apt-get", "install"],
    &["brew", "install"],
];

/// Pipe targets that write files even though the command itself reads.
const FILE_WRITING_PIPE_TARGETS: &[&str] = &["tee", "dd", "sponge"];

#[derive(Debug, Clone)]
pub struct ModePolicy {
    plan_dir: PathBuf,
    redirect_re: Regex,
}

impl ModePolicy {
    pub fn new(plan_dir: &Path) -> Self {
        Self {
            plan_dir: normalize_path(plan_dir),
            // `>` and `>>` redirections, including fd forms like `2>`.
            redirect_re: Regex::new(r"\d?>{1,2}").expect("valid regex"),
        }
    }

    /// Gate one tool call against the current mode. Returns the structured
    /// rejection the tool layer converts into a failed result (never an
    /// exception the model cannot see).
    pub fn check(
        &self,
        mode: AgentMode,
        tool: &str,
        args: &serde_json::Value,
    ) -> Result<(), PolicyError> {
        let Some(name) = ToolName::from_api_name(tool) else {
            return Err(PolicyError::UnknownTool {
                tool: tool.to_string(),
            });
        };
        match mode {
            AgentMode::Edit => Ok(()),
            AgentMode::Ask => {
                if name.is_read_only() {
                    Ok(())
                } else {
                    Err(PolicyError::AskModeRestricted {
                        tool: tool.to_string(),
                    })
                }
            }
            AgentMode::Plan => self.check_plan_mode(name, tool, args),
        }
    }

    fn check_plan_mode(
        &self,
        name: ToolName,
        tool: &str,
        args: &serde_json::Value,
    ) -> Result<(), PolicyError> {
        if name.is_read_only() {
            return Ok(());
        }
        if name.modifies_files() {
            for target in write_targets(args) {
                if !self.is_plan_file(&target) {
                    return Err(PolicyError::PlanModeRestricted { target });
                }
            }
            return Ok(());
        }
        if name == ToolName::ShellRun {
            let command = args
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            return self.screen_command(command);
        }
        Err(PolicyError::PlanModeRestricted {
            target: tool.to_string(),
        })
    }

    /// A write is permitted in plan mode only when the target is a markdown
    /// file inside the session's dedicated plan directory. Plan files live
    /// in session storage, outside the project's undo surface.
    pub fn is_plan_file(&self, target: &str) -> bool {
        let path = normalize_path(Path::new(target));
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            return false;
        }
        path.starts_with(&self.plan_dir)
    }

    /// Only read-only exploration commands pass: no output redirection, no
    /// pipes into file-writing utilities, no mutating command verbs.
    pub fn screen_command(&self, command: &str) -> Result<(), PolicyError> {
        if command.trim().is_empty() {
            return Err(PolicyError::PlanShellRestricted {
                reason: "empty command".to_string(),
            });
        }
        if self.redirect_re.is_match(command) {
            return Err(PolicyError::PlanShellRestricted {
                reason: "output redirection is not allowed".to_string(),
            });
        }
        for segment in split_segments(command) {
            let tokens: Vec<&str> = segment.split_whitespace().collect();
            let Some(first) = tokens.first() else {
                continue;
            };
            let program = first.rsplit('/').next().unwrap_or(first);
            if FILE_WRITING_PIPE_TARGETS.contains(&program) {
                return Err(PolicyError::PlanShellRestricted {
                    reason: format!("`{program}` writes files"),
                });
            }
            for denied in PLAN_MODE_DENIED_COMMANDS {
                if denied.len() <= tokens.len()
                    && denied[0] == program
                    && denied[1..] == tokens[1..denied.len()]
                {
                    return Err(PolicyError::PlanShellRestricted {
                        reason: format!("`{}` mutates state", denied.join(" ")),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Split a shell command on pipe and chaining operators so every segment's
/// program gets screened.
fn split_segments(command: &str) -> Vec<&str> {
    command
        .split(['|', ';'])
        .flat_map(|part| part.split("&&"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Paths a write-style tool call targets, pulled from its arguments. Both
/// single-path (`path` / `file_path`) and multi-edit (`edits[].file_path`)
/// shapes are understood.
pub fn write_targets(args: &serde_json::Value) -> Vec<String> {
    let mut targets = Vec::new();
    if let Some(path) = args
        .get("file_path")
        .or_else(|| args.get("path"))
        .and_then(|v| v.as_str())
    {
        targets.push(path.to_string());
    }
    if let Some(edits) = args.get("edits").and_then(|v| v.as_array()) {
        for edit in edits {
            if let Some(path) = edit.get("file_path").and_then(|v| v.as_str()) {
                targets.push(path.to_string());
            }
        }
    }
    targets
}
