use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Placeholder credential shipped in sample `.env` files.
pub const PLACEHOLDER_API_KEY: &str = "your_api_key_here";

/// Default configuration file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "workbench.yaml";

/// Top-level configuration.
///
/// Every field has a default, so an absent file yields a working
/// configuration.  Environment variables are applied on top of the file
/// by [`Config::load`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Address the gateway listens on.
    pub listen_addr: String,
    /// Root of the sandboxed project workspace.
    pub workspace_root: PathBuf,
    /// Directory for chat logs and diagnostics.
    pub data_dir: PathBuf,
    /// Static frontend served under `/frontend`.  Disabled when `None`.
    pub frontend_dir: Option<PathBuf>,
    /// Public URL of the gateway, used to build preview URLs.
    pub public_base_url: Option<String>,
    /// Separate public URL for the dev server, overriding the gateway URL.
    pub public_preview_url: Option<String>,
    /// Path prefixes never forwarded to the dev server.
    pub reserved_prefixes: Vec<String>,
    pub agent: AgentConfig,
    pub preview: PreviewConfig,
    pub logs: LogStreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            workspace_root: PathBuf::from("workspace"),
            data_dir: crate::workbench_home(),
            frontend_dir: None,
            public_base_url: None,
            public_preview_url: None,
            reserved_prefixes: vec![
                "/agent".to_string(),
                "/preview".to_string(),
                "/frontend".to_string(),
            ],
            agent: AgentConfig::default(),
            preview: PreviewConfig::default(),
            logs: LogStreamConfig::default(),
        }
    }
}

/// LLM agent settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentConfig {
    /// API credential (usually supplied via `ANTHROPIC_API_KEY`).
    pub api_key: Option<String>,
    /// Messages API endpoint.
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    /// Attempts per instruction for overload / rate-limit failures.
    pub max_attempts: usize,
    /// First backoff delay; doubles on every retry.
    pub backoff_base_ms: u64,
    /// Instructions remembered per session.
    pub history_capacity: usize,
    /// Recent instructions quoted in the prompt.
    pub recent_in_prompt: usize,
    /// Whole-request timeout for one agent call.
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: crate::models::anthropic::DEFAULT_ENDPOINT.to_string(),
            model: crate::models::anthropic::DEFAULT_MODEL.to_string(),
            max_tokens: 4096,
            max_attempts: 3,
            backoff_base_ms: 1000,
            history_capacity: 5,
            recent_in_prompt: 3,
            request_timeout_secs: 300,
        }
    }
}

impl AgentConfig {
    /// Returns the credential when it is present and not the sample placeholder.
    pub fn usable_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty() && *k != PLACEHOLDER_API_KEY)
    }
}

/// Dev-server supervision settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct PreviewConfig {
    pub host: String,
    pub port: u16,
    /// Base path handed to the dev server.
    pub base_path: String,
    /// Program to launch (run inside the workspace root).
    pub program: String,
    /// Argument template; `{host}`, `{port}` and `{base}` are substituted.
    pub args: Vec<String>,
    pub ready_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5173,
            base_path: "/".to_string(),
            program: "npm".to_string(),
            args: [
                "run",
                "dev",
                "--",
                "--host",
                "{host}",
                "--port",
                "{port}",
                "--strictPort",
                "--base",
                "{base}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ready_timeout_ms: 20_000,
            poll_interval_ms: 500,
            probe_timeout_ms: 1_000,
        }
    }
}

impl PreviewConfig {
    /// Loopback origin of the dev server, e.g. `http://127.0.0.1:5173`.
    pub fn origin(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Argument list with placeholders filled in.
    pub fn render_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args
            .iter()
            .map(|a| {
                a.replace("{host}", &self.host)
                    .replace("{port}", &port)
                    .replace("{base}", &self.base_path)
            })
            .collect()
    }
}

/// Log stream hub settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct LogStreamConfig {
    /// Replay buffer length per session.
    pub buffer_capacity: usize,
    /// Message length cap (bytes) after whitespace normalization.
    pub max_message_len: usize,
    /// Regexes; matching messages are dropped.
    pub noise_patterns: Vec<String>,
    pub keep_alive_secs: u64,
}

impl Default for LogStreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 50,
            max_message_len: 500,
            noise_patterns: vec![r"^\s*$".to_string(), r"(?i)^ping$".to_string()],
            keep_alive_secs: 25,
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// With an explicit `path` the file must exist.  Without one,
    /// [`DEFAULT_CONFIG_FILE`] in the working directory is used when
    /// present.  Environment overrides are applied afterwards.
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        let mut config = match path {
            Some(p) => Self::from_file(p).await?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                match tokio::fs::try_exists(default_path).await {
                    Ok(true) => Self::from_file(default_path).await?,
                    _ => Config::default(),
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;

        tracing::debug!(
            workspace = %config.workspace_root.display(),
            listen = %config.listen_addr,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Read and parse a YAML configuration file (no env overrides).
    pub async fn from_file(path: &Path) -> anyhow::Result<Config> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_yaml_ng::from_str(&contents).context("failed to parse config YAML")
    }

    /// Apply environment overrides using `lookup` (injected for tests).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("ANTHROPIC_API_KEY") {
            self.agent.api_key = Some(v);
        }
        if let Some(v) = get("ANTHROPIC_MODEL") {
            self.agent.model = v;
        }
        if let Some(v) = get("PUBLIC_GATEWAY_URL") {
            self.public_base_url = Some(v);
        }
        if let Some(v) = get("PUBLIC_VITE_URL") {
            self.public_preview_url = Some(v);
        }
        if let Some(v) = get("WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(v);
        }
        if let Some(v) = get("PREVIEW_PORT") {
            match v.parse::<u16>() {
                Ok(port) => self.preview.port = port,
                Err(e) => tracing::warn!(value = %v, error = %e, "ignoring invalid PREVIEW_PORT"),
            }
        }
        if let Some(v) = get("PORT") {
            self.listen_addr = format!("0.0.0.0:{v}");
        }
        if let Some(v) = get("GATEWAY_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = get("WORKBENCH_FRONTEND_DIR") {
            self.frontend_dir = Some(PathBuf::from(v));
        }
    }

    /// Validate semantic constraints that serde cannot enforce.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("config: invalid listen_addr '{}'", self.listen_addr);
        }
        if self.preview.port == 0 {
            anyhow::bail!("config: preview.port must be non-zero");
        }
        if self.preview.poll_interval_ms == 0 {
            anyhow::bail!("config: preview.poll_interval_ms=0 would busy-loop");
        }
        if self.agent.max_attempts == 0 {
            anyhow::bail!("config: agent.max_attempts must be at least 1");
        }
        if self.agent.history_capacity == 0 {
            anyhow::bail!("config: agent.history_capacity must be at least 1");
        }
        if self.logs.buffer_capacity == 0 {
            anyhow::bail!("config: logs.buffer_capacity must be at least 1");
        }
        for prefix in &self.reserved_prefixes {
            if !prefix.starts_with('/') {
                anyhow::bail!("config: reserved prefix '{prefix}' must start with '/'");
            }
        }
        for pattern in &self.logs.noise_patterns {
            regex::Regex::new(pattern)
                .with_context(|| format!("config: invalid noise pattern '{pattern}'"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.preview.port, 5173);
        assert_eq!(cfg.logs.buffer_capacity, 50);
        assert_eq!(cfg.agent.max_attempts, 3);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("ANTHROPIC_API_KEY", "sk-test"),
            ("PREVIEW_PORT", "6000"),
            ("WORKSPACE_ROOT", "/tmp/ws"),
            ("PUBLIC_VITE_URL", "https://preview.example"),
            ("GATEWAY_ADDR", "127.0.0.1:4000"),
        ]
        .into_iter()
        .collect();

        let mut cfg = Config::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.agent.usable_api_key(), Some("sk-test"));
        assert_eq!(cfg.preview.port, 6000);
        assert_eq!(cfg.workspace_root, PathBuf::from("/tmp/ws"));
        assert_eq!(cfg.public_preview_url.as_deref(), Some("https://preview.example"));
        assert_eq!(cfg.listen_addr, "127.0.0.1:4000");
    }

    #[test]
    fn invalid_preview_port_is_ignored() {
        let mut cfg = Config::default();
        cfg.apply_env(|k| (k == "PREVIEW_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(cfg.preview.port, 5173);
    }

    #[test]
    fn placeholder_key_is_not_usable() {
        let mut cfg = AgentConfig::default();
        assert!(cfg.usable_api_key().is_none());
        cfg.api_key = Some(PLACEHOLDER_API_KEY.to_string());
        assert!(cfg.usable_api_key().is_none());
        cfg.api_key = Some("   ".to_string());
        assert!(cfg.usable_api_key().is_none());
    }

    #[test]
    fn render_args_substitutes_placeholders() {
        let cfg = PreviewConfig::default();
        let args = cfg.render_args();
        assert!(args.contains(&"127.0.0.1".to_string()));
        assert!(args.contains(&"5173".to_string()));
        assert!(args.contains(&"--strictPort".to_string()));
        assert_eq!(cfg.origin(), "http://127.0.0.1:5173");
    }

    #[test]
    fn validate_rejects_bad_noise_pattern() {
        let mut cfg = Config::default();
        cfg.logs.noise_patterns = vec!["(unclosed".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_relative_prefix() {
        let mut cfg = Config::default();
        cfg.reserved_prefixes.push("api".to_string());
        assert!(cfg.validate().is_err());
    }
}
