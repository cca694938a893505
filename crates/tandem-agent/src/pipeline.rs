//! Stream-event dispatch.
//!
//! A registry of handler objects consumes one event at a time and mutates a
//! shared [`StreamContext`]. Handlers separate "what happened" from "what to
//! do about it": the driver knows nothing about individual event kinds, so
//! new kinds only require a new handler. A handler may terminate the loop by
//! returning a [`LoopSignal`]; the driver catches it and the caller runs the
//! same post-processing regardless of which signal fired.

use crate::actions::{display_input, tool_action_by_name};
use crate::events::{LoopSignal, StreamEvent, ToolOutcome};
use crate::gating::ToolGate;
use crate::{EventSource, ToolExecutor};
use std::collections::VecDeque;
use tandem_core::{AbortHandle, ChatMessage, Result, ToolCallRequest, ToolName, UiEvent};
use tandem_policy::write_targets;
use tandem_store::JournalStore;

/// Shared mutable state for one streamed turn.
pub struct StreamContext<'a> {
    pub accumulated_text: String,
    pub modified_files: Vec<String>,
    pub cleanup_owed: bool,
    pub tool_in_flight: bool,
    pub total_input_tokens: Option<u64>,
    pub chat_id: Option<u64>,
    pub gate: ToolGate<'a>,
    pub executor: &'a mut dyn ToolExecutor,
    pub journal: &'a mut JournalStore,
    ui_queue: VecDeque<UiEvent>,
}

impl<'a> StreamContext<'a> {
    pub fn new(
        gate: ToolGate<'a>,
        executor: &'a mut dyn ToolExecutor,
        journal: &'a mut JournalStore,
        chat_id: Option<u64>,
    ) -> Self {
        Self {
            accumulated_text: String::new(),
            modified_files: Vec::new(),
            cleanup_owed: false,
            tool_in_flight: false,
            total_input_tokens: None,
            chat_id,
            gate,
            executor,
            journal,
            ui_queue: VecDeque::new(),
        }
    }

    pub fn emit(&mut self, event: UiEvent) {
        self.ui_queue.push_back(event);
    }

    fn drain_ui(&mut self, sink: &mut dyn FnMut(UiEvent)) {
        while let Some(event) = self.ui_queue.pop_front() {
            sink(event);
        }
    }

    /// Flush accumulated text into the journal as an assistant message.
    fn flush_text(&mut self, total_input_tokens: Option<u64>) -> Result<()> {
        if self.accumulated_text.is_empty() {
            return Ok(());
        }
        let text = std::mem::take(&mut self.accumulated_text);
        self.journal.record_assistant(
            ChatMessage::assistant_text(text),
            self.chat_id,
            total_input_tokens,
        )
    }

    fn note_modified_files(&mut self, name: ToolName, args: &serde_json::Value) {
        if !name.modifies_files() {
            return;
        }
        for target in write_targets(args) {
            if !self.modified_files.contains(&target) {
                self.modified_files.push(target);
            }
        }
    }
}

/// One entry in the dispatch registry.
pub trait StreamHandler {
    fn can_handle(&self, event: &StreamEvent) -> bool;
    fn handle(
        &self,
        event: &StreamEvent,
        cx: &mut StreamContext<'_>,
    ) -> Result<Option<LoopSignal>>;
}

struct TextHandler;

impl StreamHandler for TextHandler {
    fn can_handle(&self, event: &StreamEvent) -> bool {
        matches!(event, StreamEvent::TextStart | StreamEvent::TextDelta { .. })
    }

    fn handle(
        &self,
        event: &StreamEvent,
        cx: &mut StreamContext<'_>,
    ) -> Result<Option<LoopSignal>> {
        match event {
            StreamEvent::TextStart => {
                cx.emit(UiEvent::ContentBlock {
                    content: "\n".to_string(),
                });
            }
            StreamEvent::TextDelta { text } => {
                cx.accumulated_text.push_str(text);
                cx.emit(UiEvent::ContentBlock {
                    content: text.clone(),
                });
            }
            _ => {}
        }
        Ok(None)
    }
}

/// Executes locally-dispatched tool calls through the gate, journals the
/// call and its result, and surfaces both to the UI.
struct ToolCallHandler;

impl StreamHandler for ToolCallHandler {
    fn can_handle(&self, event: &StreamEvent) -> bool {
        matches!(event, StreamEvent::ToolCall { .. })
    }

    fn handle(
        &self,
        event: &StreamEvent,
        cx: &mut StreamContext<'_>,
    ) -> Result<Option<LoopSignal>> {
        let StreamEvent::ToolCall {
            id,
            name,
            arguments,
        } = event
        else {
            return Ok(None);
        };

        // Any streamed text belongs to the message carrying this call; the
        // UI drops the interleaved fragments and re-renders from the tool
        // timeline instead.
        let pending_text = if cx.accumulated_text.is_empty() {
            None
        } else {
            cx.emit(UiEvent::ContentReplace {
                content: String::new(),
            });
            Some(std::mem::take(&mut cx.accumulated_text))
        };
        cx.journal.record_assistant(
            ChatMessage::Assistant {
                content: pending_text,
                tool_calls: vec![ToolCallRequest {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }],
            },
            cx.chat_id,
            None,
        )?;

        let actions = tool_action_by_name(name);
        cx.emit(UiEvent::ToolCall {
            tool_name: name.clone(),
            loading_action: actions.map(|a| a.loading.to_string()),
            display_input: display_input(name, arguments),
        });

        cx.tool_in_flight = true;
        cx.cleanup_owed = true;
        let chat_id = cx.chat_id;
        let outcome = cx.gate.execute(&mut *cx.executor, name, arguments)?;
        cx.tool_in_flight = false;
        cx.cleanup_owed = false;

        if outcome.success
            && let Some(tool) = ToolName::from_api_name(name)
        {
            cx.note_modified_files(tool, arguments);
        }

        cx.journal
            .record_tool(id, &serde_json::to_string(&outcome)?, chat_id)?;
        cx.emit(UiEvent::ToolResult {
            tool_name: name.clone(),
            success: outcome.success,
            completed_action: actions.map(|a| {
                if outcome.success {
                    a.completed.to_string()
                } else {
                    a.failed.to_string()
                }
            }),
        });
        Ok(None)
    }
}

/// Bookkeeping for tools the model layer executed itself: journal the
/// result and notify the UI, but run nothing locally.
struct ToolResultHandler;

impl StreamHandler for ToolResultHandler {
    fn can_handle(&self, event: &StreamEvent) -> bool {
        matches!(event, StreamEvent::ToolResult { .. })
    }

    fn handle(
        &self,
        event: &StreamEvent,
        cx: &mut StreamContext<'_>,
    ) -> Result<Option<LoopSignal>> {
        let StreamEvent::ToolResult { id, name, outcome } = event else {
            return Ok(None);
        };
        cx.journal
            .record_tool(id, &serde_json::to_string(outcome)?, cx.chat_id)?;
        cx.emit(UiEvent::ToolResult {
            tool_name: name.clone(),
            success: outcome.success,
            completed_action: tool_action_by_name(name).map(|a| {
                if outcome.success {
                    a.completed.to_string()
                } else {
                    a.failed.to_string()
                }
            }),
        });
        Ok(None)
    }
}

struct ErrorHandler;

impl StreamHandler for ErrorHandler {
    fn can_handle(&self, event: &StreamEvent) -> bool {
        matches!(event, StreamEvent::Error { .. })
    }

    fn handle(
        &self,
        event: &StreamEvent,
        cx: &mut StreamContext<'_>,
    ) -> Result<Option<LoopSignal>> {
        let StreamEvent::Error { message } = event else {
            return Ok(None);
        };
        cx.cleanup_owed = true;
        cx.emit(UiEvent::Error {
            error: message.clone(),
        });
        Ok(Some(LoopSignal::Fatal(message.clone())))
    }
}

struct FinishHandler;

impl StreamHandler for FinishHandler {
    fn can_handle(&self, event: &StreamEvent) -> bool {
        matches!(event, StreamEvent::Finish { .. })
    }

    fn handle(
        &self,
        event: &StreamEvent,
        cx: &mut StreamContext<'_>,
    ) -> Result<Option<LoopSignal>> {
        let StreamEvent::Finish { total_input_tokens } = event else {
            return Ok(None);
        };
        cx.total_input_tokens = *total_input_tokens;
        cx.flush_text(*total_input_tokens)?;
        Ok(Some(LoopSignal::Finished))
    }
}

#[must_use]
pub fn default_handlers() -> Vec<Box<dyn StreamHandler>> {
    vec![
        Box::new(TextHandler),
        Box::new(ToolCallHandler),
        Box::new(ToolResultHandler),
        Box::new(ErrorHandler),
        Box::new(FinishHandler),
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub signal: LoopSignal,
    pub modified_files: Vec<String>,
    pub total_input_tokens: Option<u64>,
}

/// Consume the stream one event at a time until a handler raises a signal,
/// the source ends, or the abort token fires. UI events queue up in the
/// context and are forwarded to the sink after every dispatch so delivery
/// stays strictly ordered.
pub fn drive_stream(
    source: &mut dyn EventSource,
    handlers: &[Box<dyn StreamHandler>],
    cx: &mut StreamContext<'_>,
    abort: &AbortHandle,
    sink: &mut dyn FnMut(UiEvent),
) -> Result<RunOutcome> {
    let signal = loop {
        if abort.is_aborted() {
            break LoopSignal::Aborted;
        }
        let Some(event) = source.next_event()? else {
            cx.flush_text(None)?;
            break LoopSignal::Finished;
        };
        let Some(handler) = handlers.iter().find(|h| h.can_handle(&event)) else {
            continue;
        };
        let result = handler.handle(&event, cx);
        cx.drain_ui(sink);
        if let Some(signal) = result? {
            break signal;
        }
    };
    cx.drain_ui(sink);
    Ok(RunOutcome {
        signal,
        modified_files: cx.modified_files.clone(),
        total_input_tokens: cx.total_input_tokens,
    })
}

/// Helper for the outcome of a gated execution embedded in `ToolOutcome`
/// journaling — exposed for tests that assert on journaled payloads.
#[must_use]
pub fn parse_journaled_outcome(content: &str) -> Option<ToolOutcome> {
    serde_json::from_str(content).ok()
}
