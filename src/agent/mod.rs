//! Agent orchestration: turns a natural-language instruction into applied
//! workspace operations.
//!
//! One [`Orchestrator`] exists per gateway.  For every instruction it
//! rehydrates session history (once), assembles the prompt, calls the
//! agent with retry, parses the reply, applies any operations, persists
//! a chat record and reports progress to the [`LogHub`] along the way.

pub mod prompt;
pub mod retry;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::chatlog::{ChatLog, ChatRecord, JsonlChatLog};
use crate::config::Config;
use crate::diagnostics::{DiagnosticSink, FileDiagnosticSink};
use crate::logs::{LogHub, LogLevel};
use crate::models::anthropic::AnthropicClient;
use crate::models::{AgentClient, AgentEvent, AgentQuery, EventSink};
use crate::operations::{self, ParseResult};
use crate::workspace::Workspace;

use prompt::{build_user_prompt, PromptParts, SYSTEM_PROMPT};
use retry::{call_with_retry, RetryPolicy};
use session::{SessionHandle, SessionStore};

const SOURCE_AGENT: &str = "agent";
const SOURCE_WORKSPACE: &str = "workspace";
const SOURCE_CONTEXT: &str = "context";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "success",
            ResponseStatus::Error => "error",
        }
    }
}

/// Reply to one instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionResponse {
    pub session_id: String,
    pub status: ResponseStatus,
    pub operations: Vec<Value>,
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reply to a context append.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextResponse {
    pub session_id: String,
    pub status: ResponseStatus,
    pub pending_chunk_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Reply to a history query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub session_id: String,
    pub status: ResponseStatus,
    pub history: Vec<ChatRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a successful turn produced.
struct TurnOutcome {
    operations: Vec<Value>,
    logs: Vec<String>,
    message: Option<String>,
}

pub struct Orchestrator {
    sessions: SessionStore,
    hub: LogHub,
    workspace: Workspace,
    client: Arc<dyn AgentClient>,
    chat_log: Arc<dyn ChatLog>,
    diagnostics: Arc<dyn DiagnosticSink>,
    retry: RetryPolicy,
    recent_in_prompt: usize,
}

impl Orchestrator {
    /// Wire an orchestrator from explicit collaborators.
    pub fn new(
        config: &Config,
        hub: LogHub,
        client: Arc<dyn AgentClient>,
        chat_log: Arc<dyn ChatLog>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            sessions: SessionStore::new(config.agent.history_capacity),
            hub,
            workspace: Workspace::new(&config.workspace_root),
            client,
            chat_log,
            diagnostics,
            retry: RetryPolicy {
                max_attempts: config.agent.max_attempts,
                base_delay: Duration::from_millis(config.agent.backoff_base_ms),
            },
            recent_in_prompt: config.agent.recent_in_prompt,
        }
    }

    /// Production wiring: Anthropic client plus file-backed chat log and
    /// diagnostics under the data directory.
    pub fn from_config(config: &Config, hub: LogHub) -> anyhow::Result<Self> {
        let client = AnthropicClient::from_config(&config.agent)?;
        if config.agent.usable_api_key().is_none() {
            warn!("ANTHROPIC_API_KEY is not set; instructions will fail until it is configured");
        }
        Ok(Self::new(
            config,
            hub,
            Arc::new(client),
            Arc::new(JsonlChatLog::new(config.data_dir.join("chats"))),
            Arc::new(FileDiagnosticSink::new(config.data_dir.join("diagnostics"))),
        ))
    }

    pub fn hub(&self) -> &LogHub {
        &self.hub
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Run one instruction to completion.
    ///
    /// Never fails: errors are reported in the response, persisted to the
    /// chat log and emitted on the log stream.
    pub async fn process_instruction(
        &self,
        session_id: &str,
        instruction: &str,
        file_hints: &[String],
    ) -> InstructionResponse {
        let handle = self.sessions.get(session_id);
        let _turn = handle.turn.lock().await;

        info!(session_id, hints = file_hints.len(), "processing instruction");
        let result = self.run_turn(&handle, session_id, instruction, file_hints).await;
        let agent_session_id = handle.state.lock().await.agent_session.clone();

        let response = match result {
            Ok(outcome) => {
                self.hub.info(
                    session_id,
                    format!("Instruction complete: {} operation(s)", outcome.operations.len()),
                    SOURCE_AGENT,
                );
                InstructionResponse {
                    session_id: session_id.to_string(),
                    status: ResponseStatus::Success,
                    operations: outcome.operations,
                    logs: outcome.logs,
                    message: outcome.message,
                    error: None,
                }
            }
            Err(e) => {
                let error = format!("{e:#}");
                warn!(session_id, error = %error, "instruction failed");
                self.hub
                    .error(session_id, format!("Instruction failed: {error}"), SOURCE_AGENT);
                InstructionResponse {
                    session_id: session_id.to_string(),
                    status: ResponseStatus::Error,
                    operations: Vec::new(),
                    logs: Vec::new(),
                    message: None,
                    error: Some(error),
                }
            }
        };

        let record = ChatRecord {
            instruction: instruction.to_string(),
            operations: response.operations.clone(),
            logs: response.logs.clone(),
            status: response.status.as_str().to_string(),
            error: response.error.clone(),
            message: response.message.clone(),
            agent_session_id,
            created_at: crate::utils::now_rfc3339(),
        };
        if let Err(e) = self.chat_log.append(session_id, &record).await {
            warn!(session_id, error = %e, "failed to persist chat record");
        }

        response
    }

    async fn run_turn(
        &self,
        handle: &SessionHandle,
        session_id: &str,
        instruction: &str,
        file_hints: &[String],
    ) -> anyhow::Result<TurnOutcome> {
        self.ensure_history_loaded(handle, session_id).await;

        let (recent, context, resume) = {
            let mut state = handle.state.lock().await;
            let context = std::mem::take(&mut state.pending_context);
            // The quoted window includes the instruction being run.
            state.push_instruction(instruction.to_string(), self.sessions.history_capacity());
            let recent: Vec<String> = state.instruction_history.iter().cloned().collect();
            (recent, context, state.agent_session.clone())
        };

        self.hub.info(
            session_id,
            format!("Received instruction: {instruction}"),
            SOURCE_AGENT,
        );
        if !context.is_empty() {
            self.hub.info(
                session_id,
                format!("Using {} staged context chunk(s)", context.len()),
                SOURCE_CONTEXT,
            );
        }

        let file_context = self.workspace.build_file_context(file_hints).await;
        let prompt = build_user_prompt(&PromptParts {
            recent: &recent,
            recent_limit: self.recent_in_prompt,
            instruction,
            context: &context,
            file_context: &file_context,
        });
        let query = AgentQuery {
            system: SYSTEM_PROMPT.to_string(),
            prompt,
            resume,
        };

        let forward = |event: AgentEvent| {
            self.hub
                .emit(session_id, event.level, event.message, Some(SOURCE_AGENT));
        };
        let sink: EventSink<'_> = &forward;
        let client = &self.client;
        let max_attempts = self.retry.max_attempts;

        let reply = call_with_retry(
            self.retry,
            |attempt, delay, err| {
                self.hub.warn(
                    session_id,
                    format!(
                        "Agent busy (attempt {attempt}/{max_attempts}), retrying in {}ms: {err}",
                        delay.as_millis()
                    ),
                    SOURCE_AGENT,
                );
            },
            || {
                let query = query.clone();
                async move { client.query(query, sink).await }
            },
        )
        .await?;

        if let Some(h) = reply.session_handle.clone() {
            handle.state.lock().await.agent_session = Some(h);
        }

        match operations::parse(&reply.text) {
            ParseResult::Success(items) => {
                self.hub.info(
                    session_id,
                    format!("Applying {} operation(s)", items.len()),
                    SOURCE_WORKSPACE,
                );
                let logs = self.workspace.apply_operations(&items).await;
                for line in &logs {
                    let level = if line.starts_with("Error applying") {
                        LogLevel::Error
                    } else {
                        LogLevel::Info
                    };
                    self.hub.emit(session_id, level, line, Some(SOURCE_WORKSPACE));
                }
                Ok(TurnOutcome {
                    operations: items,
                    logs,
                    message: None,
                })
            }
            ParseResult::Failure(raw) => {
                debug!(session_id, len = raw.len(), "agent reply was not an operation array");
                if let Err(e) = self.diagnostics.record_unparsed(session_id, &raw).await {
                    warn!(session_id, error = %e, "failed to store unparsed reply");
                }
                self.hub
                    .info(session_id, "Agent replied with a message", SOURCE_AGENT);
                Ok(TurnOutcome {
                    operations: Vec::new(),
                    logs: Vec::new(),
                    message: Some(raw.trim().to_string()),
                })
            }
        }
    }

    /// Rehydrate instruction history and the agent handle from the chat
    /// log, at most once per session and only if nothing is in memory.
    async fn ensure_history_loaded(&self, handle: &SessionHandle, session_id: &str) {
        {
            let mut state = handle.state.lock().await;
            if state.history_loaded {
                return;
            }
            state.history_loaded = true;
            if !state.instruction_history.is_empty() {
                return;
            }
        }

        let records = match self.chat_log.history(session_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(session_id, error = %e, "failed to load chat history");
                return;
            }
        };
        if records.is_empty() {
            return;
        }

        let capacity = self.sessions.history_capacity();
        let mut state = handle.state.lock().await;
        if !state.instruction_history.is_empty() {
            return;
        }
        let skip = records.len().saturating_sub(capacity);
        for record in &records[skip..] {
            state.push_instruction(record.instruction.clone(), capacity);
        }
        if state.agent_session.is_none() {
            state.agent_session = records
                .iter()
                .rev()
                .find_map(|r| r.agent_session_id.clone());
        }
        debug!(
            session_id,
            restored = state.instruction_history.len(),
            "session history rehydrated"
        );
    }

    /// Stage a context chunk for the session's next instruction.
    pub async fn append_context(&self, session_id: &str, content: &str) -> ContextResponse {
        let handle = self.sessions.get(session_id);
        let mut state = handle.state.lock().await;

        if content.trim().is_empty() {
            return ContextResponse {
                session_id: session_id.to_string(),
                status: ResponseStatus::Error,
                pending_chunk_count: state.pending_context.len(),
                message: Some("Context content must not be empty".to_string()),
            };
        }

        state.pending_context.push(content.to_string());
        let count = state.pending_context.len();
        drop(state);

        self.hub.info(
            session_id,
            format!("Context staged ({count} chunk(s) pending)"),
            SOURCE_CONTEXT,
        );
        ContextResponse {
            session_id: session_id.to_string(),
            status: ResponseStatus::Success,
            pending_chunk_count: count,
            message: None,
        }
    }

    /// Durable chat records for a session.
    pub async fn chat_history(&self, session_id: &str) -> HistoryResponse {
        match self.chat_log.history(session_id).await {
            Ok(history) => HistoryResponse {
                session_id: session_id.to_string(),
                status: ResponseStatus::Success,
                history,
                error: None,
            },
            Err(e) => HistoryResponse {
                session_id: session_id.to_string(),
                status: ResponseStatus::Error,
                history: Vec::new(),
                error: Some(format!("{e:#}")),
            },
        }
    }
}
