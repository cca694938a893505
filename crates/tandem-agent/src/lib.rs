//! Agent run loop: stream-event dispatch, mode-gated tool execution, and
//! the per-turn orchestration around them (undo capture, journaling,
//! compaction, cancellation).

mod actions;
mod compaction;
mod events;
mod gating;
mod pipeline;
mod session;

pub use actions::{ToolAction, display_input, tool_action, tool_action_by_name};
pub use compaction::{ExtractiveSummarizer, Summarizer, auto_compact_if_needed, is_context_limit_error};
pub use events::{LoopSignal, StreamEvent, ToolOutcome};
pub use gating::{OverflowStore, ToolGate};
pub use pipeline::{
    RunOutcome, StreamContext, StreamHandler, default_handlers, drive_stream,
    parse_journaled_outcome,
};
pub use session::{AgentSession, TurnResult};

use tandem_core::{Diagnostic, Result, ToolName};

/// Pull-based stream of model output. Strictly in-order; returning `None`
/// ends the turn. Implementations must stop producing promptly after the
/// abort token fires so the in-flight request does not leak.
pub trait EventSource {
    fn next_event(&mut self) -> Result<Option<StreamEvent>>;
}

/// One model turn: given the prepared message list and the cache annotation
/// plan, produce the event stream for this step sequence.
pub trait ModelTurn {
    fn start_turn(
        &mut self,
        messages: &[tandem_core::ChatMessage],
        cache_plan: &tandem_context::CachePlan,
    ) -> Result<Box<dyn EventSource>>;
}

/// Executes a single tool call. Implementations live at the embedding layer
/// (file tools, shell, language-server queries); the pipeline wraps every
/// call with mode gating, undo capture, and oversized-result persistence.
pub trait ToolExecutor {
    fn execute(&mut self, name: ToolName, args: &serde_json::Value) -> ToolOutcome;
}

/// Compiler/linter diagnostics collaborator.
pub trait DiagnosticsProvider {
    fn diagnostics(&self, project_root: &std::path::Path) -> Result<Vec<Diagnostic>>;
}

/// Applies a set of changed files to the live workspace (outside whatever
/// sandbox copy the agent worked in).
pub trait WorkspaceIntegrator {
    fn apply_changes(&self, changes: &[(String, String)]) -> Result<()>;
}
