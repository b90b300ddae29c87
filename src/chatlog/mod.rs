//! Durable chat log.
//!
//! One record per processed instruction, appended to
//! `<dir>/<sessionId>.jsonl`.  The orchestrator reads it back once per
//! session after a restart to rehydrate instruction history and the
//! resumable agent handle.

use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Outcome of one instruction as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub instruction: String,
    #[serde(default)]
    pub operations: Vec<Value>,
    #[serde(default)]
    pub logs: Vec<String>,
    /// `"success"` or `"error"`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    /// RFC 3339 timestamp.
    pub created_at: String,
}

#[async_trait]
pub trait ChatLog: Send + Sync {
    async fn append(&self, session_id: &str, record: &ChatRecord) -> anyhow::Result<()>;

    /// All records for a session, oldest first.  Empty when unknown.
    async fn history(&self, session_id: &str) -> anyhow::Result<Vec<ChatRecord>>;
}

/// JSONL-file implementation.
pub struct JsonlChatLog {
    dir: PathBuf,
}

impl JsonlChatLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, session_id: &str) -> anyhow::Result<PathBuf> {
        crate::utils::validate_path_segment(session_id)?;
        Ok(self.dir.join(format!("{session_id}.jsonl")))
    }
}

#[async_trait]
impl ChatLog for JsonlChatLog {
    async fn append(&self, session_id: &str, record: &ChatRecord) -> anyhow::Result<()> {
        let path = self.path_for(session_id)?;
        fs::create_dir_all(&self.dir)
            .await
            .context("create chat log dir")?;

        let line = serde_json::to_string(record).context("serialize ChatRecord")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("open chat log {}", path.display()))?;
        file.write_all(format!("{line}\n").as_bytes()).await?;

        debug!(path = %path.display(), status = %record.status, "chat record appended");
        Ok(())
    }

    async fn history(&self, session_id: &str) -> anyhow::Result<Vec<ChatRecord>> {
        let path = self.path_for(session_id)?;
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };

        let mut records = Vec::new();
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match serde_json::from_str::<ChatRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) => debug!(error = %e, "skipping malformed chat log line"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(instruction: &str) -> ChatRecord {
        ChatRecord {
            instruction: instruction.into(),
            operations: vec![],
            logs: vec![],
            status: "success".into(),
            error: None,
            message: None,
            agent_session_id: Some("h1".into()),
            created_at: crate::utils::now_rfc3339(),
        }
    }

    #[tokio::test]
    async fn append_then_read_back_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let log = JsonlChatLog::new(tmp.path().join("chats"));
        log.append("s1", &record("one")).await.unwrap();
        log.append("s1", &record("two")).await.unwrap();

        let history = log.history("s1").await.unwrap();
        let instructions: Vec<_> = history.iter().map(|r| r.instruction.as_str()).collect();
        assert_eq!(instructions, ["one", "two"]);
        assert!(log.history("s2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let log = JsonlChatLog::new(tmp.path());
        log.append("s1", &record("ok")).await.unwrap();
        let path = tmp.path().join("s1.jsonl");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{not json\n");
        std::fs::write(&path, raw).unwrap();

        assert_eq!(log.history("s1").await.unwrap().len(), 1);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(record("x")).unwrap();
        assert_eq!(json["agentSessionId"], "h1");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn rejects_traversal_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let log = JsonlChatLog::new(tmp.path());
        assert!(log.append("../escape", &record("x")).await.is_err());
    }
}
