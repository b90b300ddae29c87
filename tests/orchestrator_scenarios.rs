//! End-to-end instruction processing with a scripted agent.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{orchestrator, test_config, ScriptedAgent};
use workbench_gateway::agent::ResponseStatus;
use workbench_gateway::chatlog::{ChatLog, ChatRecord, JsonlChatLog};
use workbench_gateway::logs::LogLevel;
use workbench_gateway::models::{AgentClient, AgentQuery, AgentReply, EventSink};

const BUTTON_REPLY: &str = r#"```json
[
  {"type": "create", "path": "src/components/Button.tsx", "content": "export const Button = () => <button>Click</button>;\n"},
  {"type": "update", "path": "src/App.tsx", "content": "import { Button } from './components/Button';\nexport default () => <Button />;\n"}
]
```"#;

#[tokio::test]
async fn button_component_scenario() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let agent = ScriptedAgent::new(vec![Ok(BUTTON_REPLY)]);
    let orch = orchestrator(&config, agent.clone());

    let resp = orch
        .process_instruction("s1", "create a button component", &[])
        .await;

    assert_eq!(resp.status, ResponseStatus::Success);
    assert_eq!(resp.operations.len(), 2);
    assert_eq!(
        resp.logs,
        ["create src/components/Button.tsx", "update src/App.tsx"]
    );
    assert!(resp.message.is_none());

    let ws = config.workspace_root.clone();
    let button = std::fs::read_to_string(ws.join("src/components/Button.tsx")).unwrap();
    assert!(button.contains("<button>Click</button>"));
    assert!(ws.join("src/App.tsx").exists());

    // Applied operations are mirrored on the log stream.
    let history = orch.hub().history("s1");
    assert!(history
        .iter()
        .any(|e| e.message == "create src/components/Button.tsx"));

    // One durable record, carrying the agent handle.
    let records = JsonlChatLog::new(config.data_dir.join("chats"))
        .history("s1")
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, "success");
    assert_eq!(records[0].agent_session_id.as_deref(), Some("agent-session-1"));
}

#[tokio::test]
async fn prose_reply_becomes_message() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let prose = "Which page should the button go on?";
    let agent = ScriptedAgent::new(vec![Ok(prose)]);
    let orch = orchestrator(&config, agent);

    let resp = orch.process_instruction("s1", "add a button", &[]).await;

    assert_eq!(resp.status, ResponseStatus::Success);
    assert!(resp.operations.is_empty());
    assert!(resp.logs.is_empty());
    assert_eq!(resp.message.as_deref(), Some(prose));

    // Nothing written to the workspace.
    let entries = std::fs::read_dir(&config.workspace_root)
        .map(|rd| rd.count())
        .unwrap_or(0);
    assert_eq!(entries, 0);

    // Raw reply kept for diagnostics.
    let diag: Vec<_> = std::fs::read_dir(config.data_dir.join("diagnostics"))
        .unwrap()
        .collect();
    assert_eq!(diag.len(), 1);
}

#[tokio::test]
async fn context_is_staged_then_cleared() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let agent = ScriptedAgent::new(vec![Ok("[]"), Ok("[]")]);
    let orch = orchestrator(&config, agent.clone());

    let rejected = orch.append_context("s1", "   \n\t ").await;
    assert_eq!(rejected.status, ResponseStatus::Error);
    assert_eq!(rejected.pending_chunk_count, 0);

    assert_eq!(orch.append_context("s1", "Use Tailwind").await.pending_chunk_count, 1);
    let second = orch.append_context("s1", "Brand color is teal").await;
    assert_eq!(second.status, ResponseStatus::Success);
    assert_eq!(second.pending_chunk_count, 2);

    orch.process_instruction("s1", "style the header", &[]).await;
    let prompt = agent.last_query().prompt;
    assert!(prompt.contains("Use Tailwind\n\nBrand color is teal"), "{prompt}");

    // Cleared by the instruction: the next one sees no staged context.
    orch.process_instruction("s1", "again", &[]).await;
    assert!(!agent.last_query().prompt.contains("Use Tailwind"));
    assert_eq!(orch.append_context("s1", "more").await.pending_chunk_count, 1);
}

#[tokio::test]
async fn terminal_failure_is_persisted_and_streamed() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let agent = ScriptedAgent::new(vec![Err("Anthropic API returned 400 Bad Request: Invalid request")]);
    let orch = orchestrator(&config, agent.clone());

    let resp = orch.process_instruction("s1", "do it", &[]).await;

    assert_eq!(resp.status, ResponseStatus::Error);
    assert!(resp.error.as_deref().unwrap().contains("Invalid request"));
    assert_eq!(agent.calls(), 1, "non-transient errors are not retried");

    let last = orch.hub().history("s1").pop().unwrap();
    assert_eq!(last.level, LogLevel::Error);

    let records = JsonlChatLog::new(config.data_dir.join("chats"))
        .history("s1")
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, "error");
    assert!(records[0].error.is_some());
}

#[tokio::test]
async fn overload_is_retried_until_success() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let agent = ScriptedAgent::new(vec![
        Err("Anthropic API returned 529 <unknown status code>: overloaded"),
        Err("Overloaded"),
        Ok("[]"),
    ]);
    let orch = orchestrator(&config, agent.clone());

    let resp = orch.process_instruction("s1", "do it", &[]).await;

    assert_eq!(resp.status, ResponseStatus::Success);
    assert_eq!(agent.calls(), 3);
    let warnings = orch
        .hub()
        .history("s1")
        .into_iter()
        .filter(|e| e.level == LogLevel::Warn)
        .count();
    assert_eq!(warnings, 2);
}

#[tokio::test]
async fn recent_instructions_and_hints_reach_the_prompt() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    std::fs::create_dir_all(config.workspace_root.join("src")).unwrap();
    std::fs::write(config.workspace_root.join("src/App.tsx"), "export default 1;").unwrap();

    let agent = ScriptedAgent::new(vec![Ok("[]"), Ok("[]"), Ok("[]"), Ok("[]"), Ok("[]")]);
    let orch = orchestrator(&config, agent.clone());
    for i in 1..=4 {
        orch.process_instruction("s1", &format!("step {i}"), &[]).await;
    }
    orch.process_instruction("s1", "step 5", &["src/App.tsx".to_string()])
        .await;

    let query = agent.last_query();
    assert!(query
        .prompt
        .starts_with("Recent instructions: step 3, step 4, step 5\n\nCurrent instruction: step 5"));
    assert!(query.prompt.contains("=== src/App.tsx ===\nexport default 1;"));
    assert_eq!(query.resume.as_deref(), Some("agent-session-1"));
}

#[tokio::test]
async fn history_is_rehydrated_once_from_the_chat_log() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let log = JsonlChatLog::new(config.data_dir.join("chats"));
    for (i, instruction) in ["a", "b", "c"].iter().enumerate() {
        log.append(
            "s1",
            &ChatRecord {
                instruction: instruction.to_string(),
                operations: vec![],
                logs: vec![],
                status: "success".into(),
                error: None,
                message: None,
                agent_session_id: Some(format!("prev-{i}")),
                created_at: workbench_gateway::utils::now_rfc3339(),
            },
        )
        .await
        .unwrap();
    }

    let agent = ScriptedAgent::new(vec![Ok("[]")]);
    let orch = orchestrator(&config, agent.clone());
    orch.process_instruction("s1", "d", &[]).await;

    let query = agent.last_query();
    assert!(query.prompt.starts_with("Recent instructions: b, c, d\n"), "{}", query.prompt);
    assert_eq!(query.resume.as_deref(), Some("prev-2"));
}

/// Agent that blocks until released, counting concurrent calls.
struct GatedAgent {
    release: tokio::sync::Notify,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl AgentClient for GatedAgent {
    async fn query(&self, _query: AgentQuery, _events: EventSink<'_>) -> anyhow::Result<AgentReply> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.release.notified().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(AgentReply {
            text: "[]".into(),
            session_handle: None,
        })
    }
}

#[tokio::test]
async fn same_session_turns_are_serialized_but_context_is_not_blocked() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let agent = Arc::new(GatedAgent {
        release: tokio::sync::Notify::new(),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
    });
    let orch = Arc::new(orchestrator(&config, agent.clone()));

    let first = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.process_instruction("s1", "one", &[]).await })
    };
    let second = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.process_instruction("s1", "two", &[]).await })
    };

    // Wait for the first call to reach the agent.
    tokio::time::timeout(Duration::from_secs(2), async {
        while agent.in_flight.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Context append completes while the turn is in flight.
    let staged = tokio::time::timeout(Duration::from_secs(1), orch.append_context("s1", "late"))
        .await
        .expect("context append blocked by in-flight instruction");
    assert_eq!(staged.pending_chunk_count, 1);

    // Release both turns, one at a time.
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        agent.release.notify_one();
    }
    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap().status, ResponseStatus::Success);
    assert_eq!(b.unwrap().status, ResponseStatus::Success);
    assert_eq!(agent.max_in_flight.load(Ordering::SeqCst), 1);
}
