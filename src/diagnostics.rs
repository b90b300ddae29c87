//! Side channel for agent output that could not be parsed into operations.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;

#[async_trait]
pub trait DiagnosticSink: Send + Sync {
    /// Persist the raw agent reply for later inspection.
    async fn record_unparsed(&self, session_id: &str, raw: &str) -> anyhow::Result<()>;
}

/// Writes each reply to `<dir>/unparsed-<millis>-<session>.txt`.
pub struct FileDiagnosticSink {
    dir: PathBuf,
}

impl FileDiagnosticSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DiagnosticSink for FileDiagnosticSink {
    async fn record_unparsed(&self, session_id: &str, raw: &str) -> anyhow::Result<()> {
        crate::utils::validate_path_segment(session_id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self
            .dir
            .join(format!("unparsed-{}-{session_id}.txt", crate::utils::now_millis()));
        tokio::fs::write(&path, raw)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::debug!(path = %path.display(), "stored unparsed agent reply");
        Ok(())
    }
}
