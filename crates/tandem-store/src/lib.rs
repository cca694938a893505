use anyhow::{Context, bail};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tandem_core::{
    AgentMode, ChatMessage, HISTORY_FILE, METADATA_FILE, Result, STORAGE_VERSION,
    UndoCheckpointSummary, session_dir,
};
use uuid::Uuid;

/// Marker recorded when a turn is cancelled, so a resumed session knows the
/// prior request was cut short.
pub const INTERRUPTED_MARKER: &str = "[Request interrupted by user]";
/// Variant recorded when the cancellation landed while a tool was executing.
pub const INTERRUPTED_DURING_TOOL_MARKER: &str =
    "[Request interrupted by user during tool execution]";

const TITLE_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    User,
    Assistant,
    Tool,
    SessionStart,
    SessionEnd,
    CompactSummary,
    ModeChange,
    UndoCheckpoint,
}

impl EntryKind {
    /// Whether entries of this kind carry conversation content for the model.
    #[must_use]
    pub fn is_message(&self) -> bool {
        matches!(self, Self::User | Self::Assistant | Self::Tool)
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// One persisted journal record. Immutable once written; the log is
/// append-only and state is always re-derived by scanning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chat_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub total_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mode: Option<AgentMode>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub undo_checkpoint: Option<UndoCheckpointSummary>,
    /// Synthetic entries (the compaction summary fed to the model) are
    /// marked internal and never shown in the UI. Never persisted as true.
    #[serde(skip_serializing_if = "is_false", default)]
    pub internal: bool,
}

impl JournalEntry {
    fn bare(kind: EntryKind, session_id: Uuid) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            session_id,
            message: None,
            chat_id: None,
            total_input_tokens: None,
            summary: None,
            mode: None,
            undo_checkpoint: None,
            internal: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageOptions {
    /// Include the raw `compact_summary` marker entry (UI replay). When
    /// false, a synthetic internal summary message is substituted for the
    /// model-facing view.
    pub include_compact_summary_entry: bool,
    /// Include `undo_checkpoint` marker entries (UI replay).
    pub include_undo_checkpoint_entry: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub message_count: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_version: Option<u32>,
}

impl SessionMetadata {
    /// A session is loadable only by the storage version that wrote it;
    /// an absent version means legacy (pre-versioning) and stays loadable.
    #[must_use]
    pub fn is_compatible(&self) -> bool {
        self.session_version.is_none_or(|v| v == STORAGE_VERSION)
    }
}

/// Sessions grouped by recency for the session picker, newest first within
/// each bucket.
#[derive(Debug, Clone, Default)]
pub struct SessionBuckets {
    pub today: Vec<SessionMetadata>,
    pub yesterday: Vec<SessionMetadata>,
    pub past_week: Vec<SessionMetadata>,
    pub older: Vec<SessionMetadata>,
}

/// Append-only per-session journal plus its metadata sidecar. Owns the
/// session directory exclusively; single writer per session.
pub struct JournalStore {
    session_id: Uuid,
    dir: PathBuf,
    history_path: PathBuf,
    metadata_path: PathBuf,
    metadata: SessionMetadata,
}

impl JournalStore {
    /// Start a brand-new session under the project's storage directory.
    pub fn create(storage_root: &Path, project_root: &Path) -> Result<Self> {
        let session_id = Uuid::now_v7();
        let dir = session_dir(storage_root, project_root, session_id);
        fs::create_dir_all(&dir)?;
        let now = Utc::now();
        let metadata = SessionMetadata {
            session_id,
            title: String::new(),
            created_at: now,
            last_modified_at: now,
            message_count: 0,
            session_version: Some(STORAGE_VERSION),
        };
        let mut store = Self {
            session_id,
            history_path: dir.join(HISTORY_FILE),
            metadata_path: dir.join(METADATA_FILE),
            dir,
            metadata,
        };
        store.write_metadata()?;
        store.append(JournalEntry::bare(EntryKind::SessionStart, session_id))?;
        Ok(store)
    }

    /// Open an existing session for writing. Incompatible storage versions
    /// are a hard error here; read paths skip such sessions instead.
    pub fn open(storage_root: &Path, project_root: &Path, session_id: Uuid) -> Result<Self> {
        let dir = session_dir(storage_root, project_root, session_id);
        let metadata_path = dir.join(METADATA_FILE);
        let raw = fs::read_to_string(&metadata_path)
            .with_context(|| format!("session {session_id} not found"))?;
        let metadata: SessionMetadata = serde_json::from_str(&raw)?;
        if !metadata.is_compatible() {
            bail!(
                "session {session_id} was written by storage version {:?}, current is {STORAGE_VERSION}",
                metadata.session_version
            );
        }
        Ok(Self {
            session_id,
            history_path: dir.join(HISTORY_FILE),
            metadata_path,
            dir,
            metadata,
        })
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    #[must_use]
    pub fn session_dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    /// Append one record durably, preserving insertion order. Never rewrites
    /// prior entries. Write failures propagate to the caller — message loss
    /// is unacceptable.
    pub fn append(&mut self, entry: JournalEntry) -> Result<()> {
        let line = serde_json::to_string(&entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)?;
        writeln!(file, "{line}")?;
        file.sync_data()?;

        if entry.kind.is_message() {
            self.metadata.message_count += 1;
        }
        if self.metadata.title.is_empty()
            && entry.kind == EntryKind::User
            && let Some(ChatMessage::User { content }) = &entry.message
        {
            self.metadata.title = derive_title(content);
        }
        self.metadata.last_modified_at = Utc::now();
        self.write_metadata()?;
        Ok(())
    }

    pub fn record_user(&mut self, content: &str, chat_id: Option<u64>) -> Result<()> {
        let mut entry = JournalEntry::bare(EntryKind::User, self.session_id);
        entry.message = Some(ChatMessage::user(content));
        entry.chat_id = chat_id;
        self.append(entry)
    }

    pub fn record_assistant(
        &mut self,
        message: ChatMessage,
        chat_id: Option<u64>,
        total_input_tokens: Option<u64>,
    ) -> Result<()> {
        let mut entry = JournalEntry::bare(EntryKind::Assistant, self.session_id);
        entry.message = Some(message);
        entry.chat_id = chat_id;
        entry.total_input_tokens = total_input_tokens;
        self.append(entry)
    }

    pub fn record_tool(
        &mut self,
        tool_call_id: &str,
        content: &str,
        chat_id: Option<u64>,
    ) -> Result<()> {
        let mut entry = JournalEntry::bare(EntryKind::Tool, self.session_id);
        entry.message = Some(ChatMessage::Tool {
            tool_call_id: tool_call_id.to_string(),
            content: content.to_string(),
        });
        entry.chat_id = chat_id;
        self.append(entry)
    }

    /// The only context-pruning mechanism. Prior entries stay on disk for
    /// audit and UI replay; they are merely excluded from the model view.
    pub fn save_summary_message(&mut self, summary: &str) -> Result<()> {
        let mut entry = JournalEntry::bare(EntryKind::CompactSummary, self.session_id);
        entry.summary = Some(summary.to_string());
        self.append(entry)
    }

    pub fn save_mode_change(&mut self, mode: AgentMode) -> Result<()> {
        let mut entry = JournalEntry::bare(EntryKind::ModeChange, self.session_id);
        entry.mode = Some(mode);
        self.append(entry)
    }

    pub fn save_undo_checkpoint(
        &mut self,
        checkpoint: UndoCheckpointSummary,
        chat_id: Option<u64>,
    ) -> Result<()> {
        let mut entry = JournalEntry::bare(EntryKind::UndoCheckpoint, self.session_id);
        entry.undo_checkpoint = Some(checkpoint);
        entry.chat_id = chat_id;
        self.append(entry)
    }

    /// Record that the current turn was cut short by the user.
    pub fn save_interruption(&mut self, tool_in_flight: bool) -> Result<()> {
        let marker = if tool_in_flight {
            INTERRUPTED_DURING_TOOL_MARKER
        } else {
            INTERRUPTED_MARKER
        };
        self.record_user(marker, None)
    }

    pub fn close(&mut self) -> Result<()> {
        self.append(JournalEntry::bare(EntryKind::SessionEnd, self.session_id))
    }

    /// Scan the full log. Unparseable lines are skipped defensively — a
    /// corrupt line must not take down the read path.
    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        if !self.history_path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.history_path)?;
        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Reconstruct the ordered message view. Everything before the latest
    /// compaction checkpoint is excluded; the checkpoint itself is surfaced
    /// either as the raw marker (UI) or as a synthetic internal summary
    /// message (model), depending on `options`.
    pub fn messages(&self, options: MessageOptions) -> Result<Vec<JournalEntry>> {
        let entries = self.entries()?;
        let boundary = entries
            .iter()
            .rposition(|e| e.kind == EntryKind::CompactSummary);

        let mut out = Vec::new();
        let start = match boundary {
            Some(index) => {
                let marker = &entries[index];
                if options.include_compact_summary_entry {
                    out.push(marker.clone());
                } else if let Some(summary) = &marker.summary {
                    out.push(synthesize_summary_message(self.session_id, summary));
                }
                index + 1
            }
            None => 0,
        };

        for entry in &entries[start..] {
            match entry.kind {
                kind if kind.is_message() => out.push(entry.clone()),
                EntryKind::UndoCheckpoint if options.include_undo_checkpoint_entry => {
                    out.push(entry.clone());
                }
                _ => {}
            }
        }
        Ok(out)
    }

    /// Most recent persisted mode, or `default` if none was ever recorded.
    pub fn latest_mode(&self, default: AgentMode) -> Result<AgentMode> {
        let entries = self.entries()?;
        Ok(entries
            .iter()
            .rev()
            .find_map(|e| {
                if e.kind == EntryKind::ModeChange {
                    e.mode
                } else {
                    None
                }
            })
            .unwrap_or(default))
    }

    /// Most recent recorded input-token count, scanning backward and
    /// stopping at the latest compaction boundary so stale pre-compaction
    /// counts cannot re-trigger compaction.
    pub fn last_usage(&self) -> Result<Option<u64>> {
        let entries = self.entries()?;
        for entry in entries.iter().rev() {
            if entry.kind == EntryKind::CompactSummary {
                return Ok(None);
            }
            if let Some(tokens) = entry.total_input_tokens {
                return Ok(Some(tokens));
            }
        }
        Ok(None)
    }

    fn write_metadata(&self) -> Result<()> {
        fs::write(
            &self.metadata_path,
            serde_json::to_vec_pretty(&self.metadata)?,
        )?;
        Ok(())
    }
}

fn synthesize_summary_message(session_id: Uuid, summary: &str) -> JournalEntry {
    let mut entry = JournalEntry::bare(EntryKind::User, session_id);
    entry.message = Some(ChatMessage::user(format!(
        "Summary of the conversation so far (earlier messages were compacted):\n\n{summary}"
    )));
    entry.internal = true;
    entry
}

/// Derive a session title from the first user message: strip enclosing
/// query tags, collapse whitespace, truncate to 50 chars with an ellipsis.
#[must_use]
pub fn derive_title(content: &str) -> String {
    let stripped = strip_enclosing_tag(content.trim(), "query");
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let title: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{title}…")
    } else {
        title
    }
}

fn strip_enclosing_tag<'a>(content: &'a str, tag: &str) -> &'a str {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let trimmed = content.trim();
    if let Some(inner) = trimmed.strip_prefix(open.as_str())
        && let Some(inner) = inner.strip_suffix(close.as_str())
    {
        return inner.trim();
    }
    trimmed
}

/// List sessions for a project, grouped into recency buckets. Sessions
/// written by an incompatible storage version are excluded entirely, and
/// unreadable metadata is skipped rather than failing the listing.
pub fn list_sessions(storage_root: &Path, project_root: &Path) -> Result<SessionBuckets> {
    let project_dir = tandem_core::project_dir(storage_root, project_root);
    let mut sessions: Vec<SessionMetadata> = Vec::new();
    if project_dir.exists() {
        for dir_entry in fs::read_dir(&project_dir)? {
            let path = dir_entry?.path();
            let metadata_path = path.join(METADATA_FILE);
            if !metadata_path.is_file() {
                continue;
            }
            let Ok(raw) = fs::read_to_string(&metadata_path) else {
                continue;
            };
            let Ok(metadata) = serde_json::from_str::<SessionMetadata>(&raw) else {
                continue;
            };
            if !metadata.is_compatible() {
                continue;
            }
            sessions.push(metadata);
        }
    }
    sessions.sort_by(|a, b| b.last_modified_at.cmp(&a.last_modified_at));

    let now = Utc::now();
    let today = now.date_naive();
    let mut buckets = SessionBuckets::default();
    for session in sessions {
        let date = session.last_modified_at.date_naive();
        let age_days = today.num_days_from_ce() - date.num_days_from_ce();
        match age_days {
            0 => buckets.today.push(session),
            1 => buckets.yesterday.push(session),
            2..=7 => buckets.past_week.push(session),
            _ => buckets.older.push(session),
        }
    }
    Ok(buckets)
}

/// Most recently modified compatible session for a project, if any.
pub fn latest_session_id(storage_root: &Path, project_root: &Path) -> Result<Option<Uuid>> {
    let buckets = list_sessions(storage_root, project_root)?;
    let newest = [
        buckets.today,
        buckets.yesterday,
        buckets.past_week,
        buckets.older,
    ]
    .into_iter()
    .flatten()
    .max_by_key(|m| m.last_modified_at);
    Ok(newest.map(|m| m.session_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tandem_core::STORAGE_VERSION;

    fn scratch() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = dir.path().join("storage");
        let project = dir.path().join("project");
        fs::create_dir_all(&project).expect("project dir");
        (dir, storage, project)
    }

    #[test]
    fn append_preserves_order_and_replay_is_deterministic() {
        let (_g, storage, project) = scratch();
        let mut store = JournalStore::create(&storage, &project).expect("create");
        store.record_user("first", Some(1)).expect("user");
        store
            .record_assistant(ChatMessage::assistant_text("reply"), Some(1), Some(120))
            .expect("assistant");
        store.record_tool("call-1", "tool output", Some(1)).expect("tool");

        let a = store.messages(MessageOptions::default()).expect("read 1");
        let b = store.messages(MessageOptions::default()).expect("read 2");
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert_eq!(a[0].kind, EntryKind::User);
        assert_eq!(a[2].kind, EntryKind::Tool);
    }

    #[test]
    fn compaction_excludes_prior_entries_from_model_view() {
        let (_g, storage, project) = scratch();
        let mut store = JournalStore::create(&storage, &project).expect("create");
        store.record_user("old question", None).expect("user");
        store
            .record_assistant(ChatMessage::assistant_text("old answer"), None, None)
            .expect("assistant");
        store.save_summary_message("did some work").expect("summary");
        store.record_user("new question", None).expect("user 2");

        let model_view = store.messages(MessageOptions::default()).expect("model view");
        assert_eq!(model_view.len(), 2);
        assert!(model_view[0].internal);
        let Some(ChatMessage::User { content }) = &model_view[0].message else {
            panic!("expected synthetic user message");
        };
        assert!(content.contains("did some work"));
        assert_eq!(model_view[1].kind, EntryKind::User);

        let ui_view = store
            .messages(MessageOptions {
                include_compact_summary_entry: true,
                include_undo_checkpoint_entry: true,
            })
            .expect("ui view");
        assert_eq!(ui_view[0].kind, EntryKind::CompactSummary);
        assert!(!ui_view[0].internal);
    }

    #[test]
    fn last_usage_stops_at_compaction_boundary() {
        let (_g, storage, project) = scratch();
        let mut store = JournalStore::create(&storage, &project).expect("create");
        store
            .record_assistant(ChatMessage::assistant_text("a"), None, Some(190_000))
            .expect("assistant");
        assert_eq!(store.last_usage().expect("usage"), Some(190_000));

        store.save_summary_message("compacted").expect("summary");
        assert_eq!(store.last_usage().expect("usage after compact"), None);

        store
            .record_assistant(ChatMessage::assistant_text("b"), None, Some(4_000))
            .expect("assistant 2");
        assert_eq!(store.last_usage().expect("fresh usage"), Some(4_000));
    }

    #[test]
    fn latest_mode_scans_backward() {
        let (_g, storage, project) = scratch();
        let mut store = JournalStore::create(&storage, &project).expect("create");
        assert_eq!(
            store.latest_mode(AgentMode::Edit).expect("default"),
            AgentMode::Edit
        );
        store.save_mode_change(AgentMode::Plan).expect("mode 1");
        store.save_mode_change(AgentMode::Ask).expect("mode 2");
        assert_eq!(
            store.latest_mode(AgentMode::Edit).expect("latest"),
            AgentMode::Ask
        );
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let (_g, storage, project) = scratch();
        let mut store = JournalStore::create(&storage, &project).expect("create");
        store.record_user("hello", None).expect("user");

        let mut file = OpenOptions::new()
            .append(true)
            .open(store.history_path.clone())
            .expect("open raw");
        writeln!(file, "{{not valid json").expect("write garbage");
        store.record_user("world", None).expect("user 2");

        let view = store.messages(MessageOptions::default()).expect("read");
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn close_appends_session_end_without_touching_message_view() {
        let (_g, storage, project) = scratch();
        let mut store = JournalStore::create(&storage, &project).expect("create");
        store.record_user("hello", None).expect("user");
        store.close().expect("close");

        let entries = store.entries().expect("entries");
        assert_eq!(entries.last().expect("last").kind, EntryKind::SessionEnd);
        let view = store.messages(MessageOptions::default()).expect("view");
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn title_derivation_strips_tags_and_truncates() {
        assert_eq!(derive_title("<query>build   a service</query>"), "build a service");
        let long = "x".repeat(80);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), 51);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn incompatible_version_sessions_are_skipped_on_list_and_rejected_on_open() {
        let (_g, storage, project) = scratch();
        let store = JournalStore::create(&storage, &project).expect("create");
        let session_id = store.session_id();

        let metadata_path = store.metadata_path.clone();
        let mut metadata: SessionMetadata =
            serde_json::from_str(&fs::read_to_string(&metadata_path).expect("read"))
                .expect("parse");
        metadata.session_version = Some(STORAGE_VERSION + 1);
        fs::write(&metadata_path, serde_json::to_vec(&metadata).expect("json")).expect("write");

        let buckets = list_sessions(&storage, &project).expect("list");
        assert!(buckets.today.is_empty());
        assert!(JournalStore::open(&storage, &project, session_id).is_err());
    }

    #[test]
    fn listing_buckets_by_recency() {
        let (_g, storage, project) = scratch();
        let mut a = JournalStore::create(&storage, &project).expect("a");
        a.record_user("today's work", None).expect("user");

        let mut b = JournalStore::create(&storage, &project).expect("b");
        b.record_user("older work", None).expect("user");
        let mut stale: SessionMetadata =
            serde_json::from_str(&fs::read_to_string(&b.metadata_path).expect("read"))
                .expect("parse");
        stale.last_modified_at = Utc::now() - chrono::Duration::days(30);
        fs::write(&b.metadata_path, serde_json::to_vec(&stale).expect("json")).expect("write");

        let buckets = list_sessions(&storage, &project).expect("list");
        assert_eq!(buckets.today.len(), 1);
        assert_eq!(buckets.older.len(), 1);
        assert_eq!(buckets.today[0].title, "today's work");
    }

    proptest! {
        #[test]
        fn replay_never_includes_entries_before_latest_checkpoint(
            script in proptest::collection::vec(0u8..4, 1..40)
        ) {
            let (_g, storage, project) = scratch();
            let mut store = JournalStore::create(&storage, &project).expect("create");
            let mut checkpoints = 0usize;
            for (i, op) in script.iter().enumerate() {
                match op {
                    0 => store.record_user(&format!("u{i}"), None).expect("user"),
                    1 => store
                        .record_assistant(ChatMessage::assistant_text(format!("a{i}")), None, None)
                        .expect("assistant"),
                    2 => store.record_tool(&format!("c{i}"), "out", None).expect("tool"),
                    _ => {
                        store.save_summary_message(&format!("s{i}")).expect("summary");
                        checkpoints += 1;
                    }
                }
            }
            let first = store.messages(MessageOptions::default()).expect("read 1");
            let second = store.messages(MessageOptions::default()).expect("read 2");
            prop_assert_eq!(&first, &second);
            if checkpoints > 0 {
                prop_assert!(first.first().is_some_and(|e| e.internal));
                // Nothing in the view predates the checkpoint.
                let entries = store.entries().expect("entries");
                let boundary = entries
                    .iter()
                    .rposition(|e| e.kind == EntryKind::CompactSummary)
                    .expect("boundary");
                let tail_messages = entries[boundary + 1..]
                    .iter()
                    .filter(|e| e.kind.is_message())
                    .count();
                prop_assert_eq!(first.len(), tail_messages + 1);
            }
        }
    }
}
