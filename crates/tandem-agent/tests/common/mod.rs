use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use tandem_agent::{EventSource, ModelTurn, StreamEvent, ToolExecutor, ToolOutcome};
use tandem_core::{ChatMessage, Result, ToolName, UiEvent};

/// Model stub that replays scripted event streams, one per turn.
pub struct ScriptedModel {
    turns: VecDeque<Vec<StreamEvent>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            turns: turns.into(),
        }
    }
}

impl ModelTurn for ScriptedModel {
    fn start_turn(
        &mut self,
        _messages: &[ChatMessage],
        _cache_plan: &tandem_context::CachePlan,
    ) -> Result<Box<dyn EventSource>> {
        let events = self.turns.pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedSource {
            events: events.into(),
        }))
    }
}

struct ScriptedSource {
    events: VecDeque<StreamEvent>,
}

impl EventSource for ScriptedSource {
    fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        Ok(self.events.pop_front())
    }
}

/// Minimal real-filesystem executor for the file tools; everything else
/// echoes success.
pub struct FsExecutor {
    pub root: PathBuf,
}

impl FsExecutor {
    fn resolve(&self, path: &str) -> PathBuf {
        let candidate = PathBuf::from(path);
        if candidate.is_absolute() {
            candidate
        } else {
            self.root.join(candidate)
        }
    }
}

impl ToolExecutor for FsExecutor {
    fn execute(&mut self, name: ToolName, args: &serde_json::Value) -> ToolOutcome {
        let path = args
            .get("file_path")
            .or_else(|| args.get("path"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        match name {
            ToolName::FileWrite => {
                let target = self.resolve(path);
                if let Some(parent) = target.parent() {
                    if let Err(err) = fs::create_dir_all(parent) {
                        return ToolOutcome::error("IO_ERROR", err.to_string());
                    }
                }
                let content = args
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                match fs::write(&target, content) {
                    Ok(()) => ToolOutcome::ok(serde_json::json!({"path": path})),
                    Err(err) => ToolOutcome::error("IO_ERROR", err.to_string()),
                }
            }
            ToolName::FileRead => match fs::read_to_string(self.resolve(path)) {
                Ok(content) => ToolOutcome::ok(serde_json::Value::String(content)),
                Err(err) => ToolOutcome::error("IO_ERROR", err.to_string()),
            },
            _ => ToolOutcome::ok(serde_json::Value::Null),
        }
    }
}

/// Collects UI events for assertions.
pub fn collecting_sink(events: &mut Vec<UiEvent>) -> impl FnMut(UiEvent) + '_ {
    move |event| events.push(event)
}
