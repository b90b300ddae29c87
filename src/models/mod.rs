//! Agent query abstraction.
//!
//! The orchestrator only needs one capability from an LLM backend: send a
//! system prompt plus a user prompt, optionally resuming an earlier
//! conversation, and get text back while progress events trickle out.
//! [`AgentClient`] is that seam; [`anthropic::AnthropicClient`] is the
//! production implementation.

pub mod anthropic;

use async_trait::async_trait;

use crate::logs::LogLevel;

/// One agent request.
#[derive(Debug, Clone)]
pub struct AgentQuery {
    pub system: String,
    pub prompt: String,
    /// Handle returned by an earlier reply in the same session.
    pub resume: Option<String>,
}

/// Final text of an agent turn plus the handle for resuming it.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub text: String,
    pub session_handle: Option<String>,
}

/// Intermediate progress reported while a query runs.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentEvent {
    pub level: LogLevel,
    pub message: String,
}

impl AgentEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Debug,
            message: message.into(),
        }
    }
}

/// Callback receiving [`AgentEvent`]s.  Must not block.
pub type EventSink<'a> = &'a (dyn Fn(AgentEvent) + Send + Sync);

/// Trait implemented by every LLM backend.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Run one query to completion.
    ///
    /// Errors carry the upstream status and body in their message so the
    /// caller can classify them (overload and rate-limit errors are
    /// retried, everything else is not).
    async fn query(&self, query: AgentQuery, events: EventSink<'_>) -> anyhow::Result<AgentReply>;
}
