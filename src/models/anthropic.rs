//! Anthropic Messages API client with SSE streaming.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use super::{AgentClient, AgentEvent, AgentQuery, AgentReply, EventSink};
use crate::config::AgentConfig;

/// Default endpoint for the Messages API.
pub const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";

/// Default model.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

const API_VERSION: &str = "2023-06-01";

/// Characters of streamed output between progress events.
const PROGRESS_EVERY: usize = 400;

/// Messages kept per resumable conversation (user + assistant pairs).
const MAX_TRANSCRIPT_MESSAGES: usize = 20;

/// Provider that talks to the Anthropic Messages API.
///
/// Resumable sessions are kept in memory: each successful reply stores
/// the exchanged messages under a handle, and a later query carrying that
/// handle is sent with the earlier messages prepended.
pub struct AnthropicClient {
    api_key: Option<String>,
    endpoint: String,
    model: String,
    max_tokens: u32,
    client: Client,
    transcripts: Mutex<HashMap<String, Vec<serde_json::Value>>>,
}

impl AnthropicClient {
    /// Create a client with explicit configuration.
    ///
    /// A missing key is not an error here; every query fails with a
    /// configuration error instead, so the gateway can still start.
    pub fn with_config(
        api_key: Option<String>,
        endpoint: String,
        model: String,
        max_tokens: u32,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            api_key,
            endpoint,
            model,
            max_tokens,
            client,
            transcripts: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(cfg: &AgentConfig) -> anyhow::Result<Self> {
        Self::with_config(
            cfg.usable_api_key().map(str::to_string),
            cfg.endpoint.clone(),
            cfg.model.clone(),
            cfg.max_tokens,
            Duration::from_secs(cfg.request_timeout_secs),
        )
    }

    fn api_key(&self) -> anyhow::Result<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty() && *k != crate::config::PLACEHOLDER_API_KEY)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "ANTHROPIC_API_KEY is required; set it in the environment or .env file"
                )
            })
    }

    fn prior_messages(&self, handle: Option<&str>) -> Vec<serde_json::Value> {
        let Some(handle) = handle else {
            return Vec::new();
        };
        let transcripts = self.transcripts.lock().unwrap_or_else(|e| e.into_inner());
        match transcripts.get(handle) {
            Some(messages) => messages.clone(),
            None => {
                debug!(handle, "unknown agent session handle, starting fresh");
                Vec::new()
            }
        }
    }

    fn store_transcript(&self, handle: &str, mut messages: Vec<serde_json::Value>) {
        if messages.len() > MAX_TRANSCRIPT_MESSAGES {
            let excess = messages.len() - MAX_TRANSCRIPT_MESSAGES;
            messages.drain(..excess);
        }
        let mut transcripts = self.transcripts.lock().unwrap_or_else(|e| e.into_inner());
        transcripts.insert(handle.to_string(), messages);
    }
}

#[async_trait]
impl AgentClient for AnthropicClient {
    async fn query(&self, query: AgentQuery, events: EventSink<'_>) -> anyhow::Result<AgentReply> {
        let api_key = self.api_key()?;

        let mut messages = self.prior_messages(query.resume.as_deref());
        messages.push(json!({ "role": "user", "content": query.prompt }));

        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": query.system,
            "messages": messages,
            "stream": true,
        });

        events(AgentEvent::info(format!(
            "Sending request to {} ({} message(s))",
            self.model,
            messages.len()
        )));

        let resp = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic API returned {status}: {text}");
        }

        use tokio_stream::StreamExt as _;
        let mut byte_stream = resp.bytes_stream();
        // Raw bytes; a multi-byte character may straddle two chunks.
        let mut buffer: Vec<u8> = Vec::new();
        let mut text = String::new();
        let mut next_progress = PROGRESS_EVERY;

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk);

            while let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=newline_pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end();

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<serde_json::Value>(data.trim()) else {
                    continue;
                };
                match event["type"].as_str().unwrap_or("") {
                    "content_block_delta" => {
                        if let Some(delta) = event["delta"]["text"].as_str() {
                            text.push_str(delta);
                            if text.len() >= next_progress {
                                events(AgentEvent::debug(format!(
                                    "Agent is writing… {} characters so far",
                                    text.len()
                                )));
                                next_progress = text.len() + PROGRESS_EVERY;
                            }
                        }
                    }
                    "message_delta" => {
                        let stop = event["delta"]["stop_reason"].as_str().unwrap_or("unknown");
                        let tokens = event["usage"]["output_tokens"].as_u64().unwrap_or(0);
                        events(AgentEvent::info(format!(
                            "Agent finished ({stop}, {tokens} output tokens)"
                        )));
                        if stop == "max_tokens" {
                            warn!(model = %self.model, "agent reply truncated at max_tokens");
                        }
                    }
                    "error" => {
                        let kind = event["error"]["type"].as_str().unwrap_or("error");
                        let msg = event["error"]["message"].as_str().unwrap_or("");
                        anyhow::bail!("Anthropic stream error {kind}: {msg}");
                    }
                    _ => {}
                }
            }
        }

        let handle = query
            .resume
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        messages.push(json!({ "role": "assistant", "content": text }));
        self.store_transcript(&handle, messages);

        Ok(AgentReply {
            text,
            session_handle: Some(handle),
        })
    }
}
