//! Session inspection CLI: list sessions, replay a journal, manage the
//! latest undo checkpoint. The editor extensions drive the library crates
//! directly; this binary exists for debugging session storage from a
//! terminal.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tandem_core::{AgentMode, AppConfig, ChatMessage, session_dir};
use tandem_store::{JournalStore, MessageOptions, SessionMetadata, list_sessions};
use tandem_undo::UndoCheckpointManager;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tandem", about = "Inspect tandem agent session storage")]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List sessions for the project, grouped by recency.
    Sessions,
    /// Print a session's conversation, including compaction markers.
    Replay {
        session_id: Uuid,
        /// Show every raw journal entry instead of the message view.
        #[arg(long)]
        raw: bool,
    },
    /// Show or restore the latest undo checkpoint of a session.
    Undo {
        session_id: Uuid,
        /// Apply the restore instead of only printing the checkpoint.
        #[arg(long)]
        apply: bool,
        /// Restore even when later edits conflict with the checkpoint.
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let project = match cli.project {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let cfg = AppConfig::load(&project)?;
    let storage_root = cfg.storage_root_path();

    match cli.command {
        Command::Sessions => {
            let buckets = list_sessions(&storage_root, &project)?;
            print_bucket("Today", &buckets.today);
            print_bucket("Yesterday", &buckets.yesterday);
            print_bucket("Past week", &buckets.past_week);
            print_bucket("Older", &buckets.older);
        }
        Command::Replay { session_id, raw } => {
            let store = JournalStore::open(&storage_root, &project, session_id)
                .context("session is missing or incompatible")?;
            if raw {
                for entry in store.entries()? {
                    println!("{}", serde_json::to_string(&entry)?);
                }
            } else {
                let entries = store.messages(MessageOptions {
                    include_compact_summary_entry: true,
                    include_undo_checkpoint_entry: true,
                })?;
                for entry in entries {
                    print_entry(&entry);
                }
                println!(
                    "\nmode: {}",
                    store.latest_mode(AgentMode::Edit)?
                );
            }
        }
        Command::Undo {
            session_id,
            apply,
            force,
        } => {
            let dir = session_dir(&storage_root, &project, session_id);
            if !dir.exists() {
                bail!("session {session_id} not found");
            }
            let mut manager = UndoCheckpointManager::new(&project, &dir);
            let Some(checkpoint) = manager.latest_checkpoint()? else {
                println!("no undo checkpoint recorded");
                return Ok(());
            };
            println!(
                "checkpoint {} ({} file(s), created {})",
                checkpoint.checkpoint_id,
                checkpoint.files.len(),
                checkpoint.created_at
            );
            for file in &checkpoint.files {
                println!(
                    "  {} (+{} -{})",
                    file.path, file.added_lines, file.deleted_lines
                );
            }
            let conflicts = manager.conflicted_files(&checkpoint)?;
            if !conflicts.is_empty() {
                println!("conflicted since checkpoint: {}", conflicts.join(", "));
            }
            if apply {
                let restored = manager.restore_latest(force)?;
                println!("restored {} file(s)", restored.len());
            }
        }
    }
    Ok(())
}

fn print_bucket(label: &str, sessions: &[SessionMetadata]) {
    if sessions.is_empty() {
        return;
    }
    println!("{label}:");
    for session in sessions {
        println!(
            "  {}  {:>4} msgs  {}",
            session.session_id,
            session.message_count,
            if session.title.is_empty() {
                "(untitled)"
            } else {
                session.title.as_str()
            }
        );
    }
}

fn print_entry(entry: &tandem_store::JournalEntry) {
    match (&entry.kind, &entry.message) {
        (_, Some(ChatMessage::User { content })) => println!("user> {content}"),
        (_, Some(ChatMessage::Assistant {
            content,
            tool_calls,
        })) => {
            if let Some(text) = content {
                println!("assistant> {text}");
            }
            for call in tool_calls {
                println!("assistant> [tool_call {}]", call.name);
            }
        }
        (_, Some(ChatMessage::Tool { tool_call_id, .. })) => {
            println!("tool> [result for {tool_call_id}]");
        }
        (tandem_store::EntryKind::CompactSummary, _) => {
            println!(
                "--- compacted: {} ---",
                entry.summary.as_deref().unwrap_or("")
            );
        }
        (tandem_store::EntryKind::UndoCheckpoint, _) => {
            let files = entry
                .undo_checkpoint
                .as_ref()
                .map(|c| c.files.len())
                .unwrap_or(0);
            println!("--- undo checkpoint ({files} file(s)) ---");
        }
        _ => {}
    }
}
