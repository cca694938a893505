mod common;

use common::{FsExecutor, ScriptedModel, collecting_sink};
use serde_json::json;
use tandem_agent::{AgentSession, ExtractiveSummarizer, StreamEvent, parse_journaled_outcome};
use tandem_core::{AbortHandle, AgentMode, AppConfig, ChatMessage, PLAN_DIR};
use tandem_store::{EntryKind, MessageOptions};
use tandem_testkit::TempProject;

fn session_for(project: &TempProject) -> AgentSession {
    let cfg = AppConfig {
        storage_root: Some(project.storage_root.to_string_lossy().to_string()),
        ..AppConfig::default()
    };
    AgentSession::create(&project.project_root, cfg).expect("session")
}

fn last_tool_outcome(session: &AgentSession) -> tandem_agent::ToolOutcome {
    let entries = session
        .journal
        .messages(MessageOptions::default())
        .expect("messages");
    let content = entries
        .iter()
        .rev()
        .find(|e| e.kind == EntryKind::Tool)
        .and_then(|e| match &e.message {
            Some(ChatMessage::Tool { content, .. }) => Some(content.clone()),
            _ => None,
        })
        .expect("tool entry");
    parse_journaled_outcome(&content).expect("outcome json")
}

fn run_single_tool_turn(
    session: &mut AgentSession,
    tool: &str,
    args: serde_json::Value,
) -> tandem_agent::TurnResult {
    let mut model = ScriptedModel::new(vec![vec![
        StreamEvent::ToolCall {
            id: "call-1".to_string(),
            name: tool.to_string(),
            arguments: args,
        },
        StreamEvent::Finish {
            total_input_tokens: Some(900),
        },
    ]]);
    let mut executor = FsExecutor {
        root: session.journal.session_dir().to_path_buf(),
    };
    let mut events = Vec::new();
    let mut sink = collecting_sink(&mut events);
    session
        .run_turn(
            "do the thing",
            &mut model,
            &mut executor,
            &ExtractiveSummarizer,
            None,
            &AbortHandle::new(),
            &mut sink,
        )
        .expect("turn")
}

#[test]
fn ask_mode_rejects_file_writes_without_touching_disk() {
    let project = TempProject::new().expect("project");
    project.write_file("src/main.bal", "original").expect("seed");
    let mut session = session_for(&project);
    session.set_mode(AgentMode::Ask).expect("mode");

    let target = project.project_root.join("src/main.bal");
    let result = run_single_tool_turn(
        &mut session,
        "file_write",
        json!({"file_path": target.to_string_lossy(), "content": "overwritten"}),
    );

    assert!(result.success, "turn completes; the rejection is a value");
    assert!(result.modified_files.is_empty());
    let outcome = last_tool_outcome(&session);
    assert!(!outcome.success);
    assert_eq!(outcome.error_code.as_deref(), Some("ASK_MODE_RESTRICTED"));
    assert_eq!(project.read_file("src/main.bal").expect("read"), "original");
}

#[test]
fn plan_mode_allows_plan_markdown_but_rejects_source_writes() {
    let project = TempProject::new().expect("project");
    project.write_file("src/main.bal", "original").expect("seed");
    let mut session = session_for(&project);
    session.set_mode(AgentMode::Plan).expect("mode");

    let plan_file = session.journal.session_dir().join(PLAN_DIR).join("plan.md");
    let result = run_single_tool_turn(
        &mut session,
        "file_write",
        json!({"file_path": plan_file.to_string_lossy(), "content": "# Plan\n"}),
    );
    assert!(result.success);
    let outcome = last_tool_outcome(&session);
    assert!(outcome.success, "plan markdown write allowed: {outcome:?}");
    assert_eq!(
        std::fs::read_to_string(&plan_file).expect("plan file"),
        "# Plan\n"
    );

    let target = project.project_root.join("src/main.bal");
    run_single_tool_turn(
        &mut session,
        "file_write",
        json!({"file_path": target.to_string_lossy(), "content": "hacked"}),
    );
    let outcome = last_tool_outcome(&session);
    assert!(!outcome.success);
    assert_eq!(outcome.error_code.as_deref(), Some("PLAN_MODE_RESTRICTED"));
    assert_eq!(project.read_file("src/main.bal").expect("read"), "original");
}

#[test]
fn plan_mode_screens_shell_commands_through_the_gate() {
    let project = TempProject::new().expect("project");
    let mut session = session_for(&project);
    session.set_mode(AgentMode::Plan).expect("mode");

    run_single_tool_turn(
        &mut session,
        "shell_run",
        json!({"command": "echo poem > poem.txt"}),
    );
    let outcome = last_tool_outcome(&session);
    assert!(!outcome.success);
    assert_eq!(outcome.error_code.as_deref(), Some("PLAN_SHELL_RESTRICTED"));

    run_single_tool_turn(&mut session, "shell_run", json!({"command": "ls src"}));
    let outcome = last_tool_outcome(&session);
    assert!(outcome.success, "read-only command allowed: {outcome:?}");
}

#[test]
fn mode_changes_persist_through_the_journal() {
    let project = TempProject::new().expect("project");
    let mut session = session_for(&project);
    session.set_mode(AgentMode::Plan).expect("mode");
    assert_eq!(
        session.journal.latest_mode(AgentMode::Edit).expect("mode"),
        AgentMode::Plan
    );
}
