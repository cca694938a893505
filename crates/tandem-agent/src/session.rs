//! Per-session turn orchestration.
//!
//! One [`AgentSession`] owns a session directory exclusively: its journal,
//! undo manager, overflow store, observer, and cache budget. The run loop is
//! sequential; independent agent runs own independent sessions and share no
//! mutable state.

use crate::compaction::{Summarizer, auto_compact_if_needed, compact_now, is_context_limit_error};
use crate::gating::{OverflowStore, ToolGate};
use crate::pipeline::{StreamContext, default_handlers, drive_stream};
use crate::{DiagnosticsProvider, LoopSignal, ModelTurn, ToolExecutor};
use anyhow::Context;
use std::path::{Path, PathBuf};
use tandem_context::CacheBudget;
use tandem_core::{
    AbortHandle, AgentMode, AppConfig, CheckpointSource, ChatMessage, PLAN_DIR, Result, UiEvent,
};
use tandem_observe::Observer;
use tandem_policy::ModePolicy;
use tandem_store::{EntryKind, JournalStore, MessageOptions, latest_session_id};
use tandem_undo::UndoCheckpointManager;

#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub success: bool,
    pub modified_files: Vec<String>,
    pub error: Option<String>,
    pub aborted: bool,
}

pub struct AgentSession {
    project_root: PathBuf,
    cfg: AppConfig,
    pub journal: JournalStore,
    pub undo: UndoCheckpointManager,
    pub observer: Observer,
    policy: ModePolicy,
    overflow: OverflowStore,
    cache: CacheBudget,
    mode: AgentMode,
    chat_counter: u64,
}

impl AgentSession {
    /// Resume the most recent compatible session for the project, or start
    /// a new one.
    pub fn open_or_create(project_root: &Path, cfg: AppConfig) -> Result<Self> {
        let storage_root = cfg.storage_root_path();
        let journal = match latest_session_id(&storage_root, project_root)? {
            Some(session_id) => JournalStore::open(&storage_root, project_root, session_id)
                .with_context(|| format!("resuming session {session_id}"))?,
            None => JournalStore::create(&storage_root, project_root)?,
        };
        Self::with_journal(project_root, cfg, journal)
    }

    /// Always start a fresh session.
    pub fn create(project_root: &Path, cfg: AppConfig) -> Result<Self> {
        let storage_root = cfg.storage_root_path();
        let journal = JournalStore::create(&storage_root, project_root)?;
        Self::with_journal(project_root, cfg, journal)
    }

    fn with_journal(project_root: &Path, cfg: AppConfig, journal: JournalStore) -> Result<Self> {
        let session_dir = journal.session_dir().to_path_buf();
        let plan_dir = session_dir.join(PLAN_DIR);
        let mode = journal.latest_mode(AgentMode::Edit)?;
        let chat_counter = journal
            .entries()?
            .iter()
            .filter_map(|e| e.chat_id)
            .max()
            .unwrap_or(0);
        Ok(Self {
            project_root: project_root.to_path_buf(),
            undo: UndoCheckpointManager::new(project_root, &session_dir)
                .with_stack_limit(cfg.undo_stack_limit),
            observer: Observer::new(&session_dir, &cfg.telemetry)?,
            policy: ModePolicy::new(&plan_dir),
            overflow: OverflowStore::new(&session_dir, cfg.oversized_result_chars),
            cache: CacheBudget::new(cfg.cache_budget_threshold_tokens),
            mode,
            chat_counter,
            cfg,
            journal,
        })
    }

    #[must_use]
    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    /// Switch modes, persisting the change. Entering plan mode creates the
    /// session's plan directory so the write exception has a target.
    pub fn set_mode(&mut self, mode: AgentMode) -> Result<()> {
        if mode == self.mode {
            return Ok(());
        }
        if mode == AgentMode::Plan {
            std::fs::create_dir_all(self.journal.session_dir().join(PLAN_DIR))?;
        }
        self.journal.save_mode_change(mode)?;
        self.mode = mode;
        Ok(())
    }

    /// Model-facing message list reconstructed from the journal.
    pub fn model_messages(&self) -> Result<Vec<ChatMessage>> {
        Ok(self
            .journal
            .messages(MessageOptions::default())?
            .into_iter()
            .filter_map(|entry| entry.message)
            .collect())
    }

    /// Explicit user-triggered compaction.
    pub fn compact(&mut self, summarizer: &dyn Summarizer) -> Result<bool> {
        let compacted = compact_now(&mut self.journal, summarizer)?;
        if compacted {
            self.cache.reset();
        }
        Ok(compacted)
    }

    /// Run one agent turn: journal the prompt, open an undo run, stream the
    /// model's events through the dispatch pipeline, and settle the undo
    /// checkpoint according to how the stream terminated. On a context-limit
    /// failure the conversation is compacted and the turn retried once.
    pub fn run_turn(
        &mut self,
        prompt: &str,
        model: &mut dyn ModelTurn,
        executor: &mut dyn ToolExecutor,
        summarizer: &dyn Summarizer,
        diagnostics: Option<&dyn DiagnosticsProvider>,
        abort: &AbortHandle,
        sink: &mut dyn FnMut(UiEvent),
    ) -> Result<TurnResult> {
        self.chat_counter += 1;
        let chat_id = Some(self.chat_counter);

        if auto_compact_if_needed(&mut self.journal, &self.cfg, summarizer)? {
            self.cache.reset();
            self.emit(sink, self.latest_summary_event()?);
        }

        self.journal.record_user(prompt, chat_id)?;

        let mut retried_after_compact = false;
        loop {
            self.undo.begin_run(CheckpointSource::Agent);
            let outcome = self.run_stream_once(model, executor, chat_id, abort, sink)?;

            match outcome {
                StreamSettled::Finished {
                    modified_files,
                    total_input_tokens,
                } => {
                    if let Some(checkpoint) = self.undo.commit_run()? {
                        self.journal
                            .save_undo_checkpoint(checkpoint.clone(), chat_id)?;
                        self.emit(sink, UiEvent::UndoCheckpoint {
                            checkpoint,
                        });
                    }
                    if !modified_files.is_empty()
                        && let Some(provider) = diagnostics
                    {
                        let found = provider.diagnostics(&self.project_root)?;
                        if !found.is_empty() {
                            self.emit(sink, UiEvent::Diagnostics { diagnostics: found });
                        }
                    }
                    self.emit(sink, UiEvent::Stop {
                        modified_files: modified_files.clone(),
                        total_input_tokens,
                    });
                    return Ok(TurnResult {
                        success: true,
                        modified_files,
                        error: None,
                        aborted: false,
                    });
                }
                StreamSettled::Aborted { tool_in_flight } => {
                    self.undo.discard_pending_run();
                    self.journal.save_interruption(tool_in_flight)?;
                    self.emit(sink, UiEvent::Stop {
                        modified_files: Vec::new(),
                        total_input_tokens: None,
                    });
                    return Ok(TurnResult {
                        success: false,
                        modified_files: Vec::new(),
                        error: Some("aborted by user".to_string()),
                        aborted: true,
                    });
                }
                StreamSettled::Fatal { message } => {
                    self.undo.discard_pending_run();
                    if is_context_limit_error(&message) && !retried_after_compact {
                        // Compact and retry once for seamless recovery.
                        retried_after_compact = true;
                        self.observer.warn(&format!(
                            "context limit hit mid-run; compacting and retrying: {message}"
                        ));
                        if compact_now(&mut self.journal, summarizer)? {
                            self.cache.reset();
                            self.emit(sink, self.latest_summary_event()?);
                            continue;
                        }
                    }
                    return Ok(TurnResult {
                        success: false,
                        modified_files: Vec::new(),
                        error: Some(message),
                        aborted: false,
                    });
                }
            }
        }
    }

    fn run_stream_once(
        &mut self,
        model: &mut dyn ModelTurn,
        executor: &mut dyn ToolExecutor,
        chat_id: Option<u64>,
        abort: &AbortHandle,
        sink: &mut dyn FnMut(UiEvent),
    ) -> Result<StreamSettled> {
        let messages = self
            .journal
            .messages(MessageOptions::default())?
            .into_iter()
            .filter_map(|entry| entry.message)
            .collect::<Vec<_>>();
        let cache_plan = self.cache.annotate(&messages);
        let mut source = model.start_turn(&messages, &cache_plan)?;

        self.emit(sink, UiEvent::Start);
        let handlers = default_handlers();
        let gate = ToolGate {
            mode: self.mode,
            policy: &self.policy,
            undo: &mut self.undo,
            overflow: &self.overflow,
        };
        let mut cx = StreamContext::new(gate, executor, &mut self.journal, chat_id);
        let outcome = drive_stream(source.as_mut(), &handlers, &mut cx, abort, sink)?;
        let tool_in_flight = cx.tool_in_flight;
        let cleanup_owed = cx.cleanup_owed;
        drop(cx);

        if cleanup_owed {
            self.observer
                .info("stream terminated with cleanup owed; pending undo run will be discarded");
        }
        Ok(match outcome.signal {
            LoopSignal::Finished => StreamSettled::Finished {
                modified_files: outcome.modified_files,
                total_input_tokens: outcome.total_input_tokens,
            },
            LoopSignal::Aborted => StreamSettled::Aborted { tool_in_flight },
            LoopSignal::Fatal(message) => StreamSettled::Fatal { message },
        })
    }

    fn latest_summary_event(&self) -> Result<UiEvent> {
        let summary = self
            .journal
            .entries()?
            .into_iter()
            .rev()
            .find(|e| e.kind == EntryKind::CompactSummary)
            .and_then(|e| e.summary)
            .unwrap_or_default();
        Ok(UiEvent::CompactSummary { summary })
    }

    fn emit(&self, sink: &mut dyn FnMut(UiEvent), event: UiEvent) {
        if let Err(err) = self.observer.record_ui_event(&event) {
            self.observer.warn(&format!("failed to log event: {err}"));
        }
        sink(event);
    }
}

enum StreamSettled {
    Finished {
        modified_files: Vec<String>,
        total_input_tokens: Option<u64>,
    },
    Aborted {
        tool_in_flight: bool,
    },
    Fatal {
        message: String,
    },
}
