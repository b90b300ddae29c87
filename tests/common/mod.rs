//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use workbench_gateway::agent::Orchestrator;
use workbench_gateway::chatlog::JsonlChatLog;
use workbench_gateway::config::Config;
use workbench_gateway::diagnostics::FileDiagnosticSink;
use workbench_gateway::logs::LogHub;
use workbench_gateway::models::{AgentClient, AgentEvent, AgentQuery, AgentReply, EventSink};

/// Agent that replays a fixed list of outcomes, one per call.
pub struct ScriptedAgent {
    replies: Mutex<VecDeque<Result<String, String>>>,
    pub calls: AtomicUsize,
    pub queries: Mutex<Vec<AgentQuery>>,
    handle: String,
}

impl ScriptedAgent {
    pub fn new(replies: Vec<Result<&str, &str>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
            handle: "agent-session-1".to_string(),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_query(&self) -> AgentQuery {
        self.queries.lock().unwrap().last().cloned().expect("no query recorded")
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn query(&self, query: AgentQuery, events: EventSink<'_>) -> anyhow::Result<AgentReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query);
        events(AgentEvent::info("Agent is thinking"));
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(AgentReply {
                text,
                session_handle: Some(self.handle.clone()),
            }),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Err(anyhow::anyhow!("no scripted reply left")),
        }
    }
}

/// Config rooted in a temp dir, with millisecond backoff.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.workspace_root = root.join("workspace");
    config.data_dir = root.join("data");
    config.listen_addr = "127.0.0.1:0".to_string();
    config.agent.backoff_base_ms = 1;
    config
}

pub fn orchestrator(config: &Config, agent: Arc<dyn AgentClient>) -> Orchestrator {
    Orchestrator::new(
        config,
        LogHub::new(&config.logs).unwrap(),
        agent,
        Arc::new(JsonlChatLog::new(config.data_dir.join("chats"))),
        Arc::new(FileDiagnosticSink::new(config.data_dir.join("diagnostics"))),
    )
}

/// Free loopback port (bound then released).
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
