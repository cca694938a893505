//! Tool-call to UI-action string mapping. Purely presentational, data
//! driven, no control-flow effect.

use serde_json::Value;
use tandem_core::ToolName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolAction {
    pub loading: &'static str,
    pub completed: &'static str,
    pub failed: &'static str,
}

#[must_use]
pub fn tool_action(name: ToolName) -> ToolAction {
    match name {
        ToolName::FileRead => ToolAction {
            loading: "reading file",
            completed: "read file",
            failed: "failed to read file",
        },
        ToolName::FileWrite => ToolAction {
            loading: "writing file",
            completed: "wrote file",
            failed: "failed to write file",
        },
        ToolName::FileEdit => ToolAction {
            loading: "editing file",
            completed: "edited file",
            failed: "failed to edit file",
        },
        ToolName::MultiEdit => ToolAction {
            loading: "applying edits",
            completed: "applied edits",
            failed: "failed to apply edits",
        },
        ToolName::Grep => ToolAction {
            loading: "searching content",
            completed: "searched content",
            failed: "search failed",
        },
        ToolName::Glob => ToolAction {
            loading: "finding files",
            completed: "found files",
            failed: "file search failed",
        },
        ToolName::ShellRun => ToolAction {
            loading: "running command",
            completed: "ran command",
            failed: "command failed",
        },
        ToolName::KillShell => ToolAction {
            loading: "stopping shell",
            completed: "stopped shell",
            failed: "failed to stop shell",
        },
        ToolName::ValidateCode => ToolAction {
            loading: "checking diagnostics",
            completed: "checked diagnostics",
            failed: "diagnostics check failed",
        },
        ToolName::BuildProject => ToolAction {
            loading: "building project",
            completed: "built project",
            failed: "build failed",
        },
        ToolName::AskUser => ToolAction {
            loading: "waiting for your answer",
            completed: "received answer",
            failed: "question cancelled",
        },
        ToolName::EnterPlanMode => ToolAction {
            loading: "entering plan mode",
            completed: "entered plan mode",
            failed: "failed to enter plan mode",
        },
        ToolName::ExitPlanMode => ToolAction {
            loading: "requesting plan approval",
            completed: "plan approved",
            failed: "plan approval declined",
        },
        ToolName::TaskWrite => ToolAction {
            loading: "updating task list",
            completed: "updated task list",
            failed: "task list update rejected",
        },
    }
}

#[must_use]
pub fn tool_action_by_name(name: &str) -> Option<ToolAction> {
    ToolName::from_api_name(name).map(tool_action)
}

/// The small slice of tool arguments worth echoing in the UI. Everything
/// else (file contents, diffs) stays out of the event payload.
#[must_use]
pub fn display_input(name: &str, args: &Value) -> Option<Value> {
    let tool = ToolName::from_api_name(name)?;
    let picked = match tool {
        ToolName::FileRead | ToolName::FileWrite | ToolName::FileEdit => args
            .get("file_path")
            .or_else(|| args.get("path"))
            .map(|p| serde_json::json!({ "file_path": p })),
        ToolName::MultiEdit => args
            .get("edits")
            .and_then(|e| e.as_array())
            .map(|e| serde_json::json!({ "edit_count": e.len() })),
        ToolName::Grep | ToolName::Glob => args
            .get("pattern")
            .map(|p| serde_json::json!({ "pattern": p })),
        ToolName::ShellRun => args
            .get("command")
            .map(|c| serde_json::json!({ "command": c })),
        ToolName::BuildProject | ToolName::KillShell => Some(serde_json::json!({})),
        ToolName::ValidateCode => args
            .get("file_paths")
            .map(|p| serde_json::json!({ "file_paths": p })),
        ToolName::AskUser
        | ToolName::EnterPlanMode
        | ToolName::ExitPlanMode
        | ToolName::TaskWrite => Some(serde_json::json!({})),
    };
    picked.or(Some(serde_json::json!({})))
}
