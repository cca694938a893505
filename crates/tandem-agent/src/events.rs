use serde::{Deserialize, Serialize};

/// Structured result of a tool execution. Failures are values the model can
/// see and react to, never exceptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<String>,
}

impl ToolOutcome {
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error_code: None,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::json!({ "error": message.into() }),
            error_code: Some(code.to_string()),
        }
    }
}

/// One unit of incremental model output. A closed union: adding a kind is a
/// compile-time-checked change across every handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextStart,
    TextDelta {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// Result of a tool the model layer executed itself (remote tools).
    /// Locally-dispatched tools are executed by the pipeline when the
    /// `ToolCall` event arrives and never produce this.
    ToolResult {
        id: String,
        name: String,
        outcome: ToolOutcome,
    },
    Error {
        message: String,
    },
    Finish {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        total_input_tokens: Option<u64>,
    },
}

/// Control-flow signal that terminates stream consumption. Exactly one of
/// these unwinds the loop; everything else is a structured result. The
/// driver runs the same post-processing regardless of which signal fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopSignal {
    /// Normal completion (`Finish` event or stream end).
    Finished,
    /// The abort token fired.
    Aborted,
    /// Unrecoverable model error.
    Fatal(String),
}
