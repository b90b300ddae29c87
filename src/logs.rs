//! Per-session live log streaming.
//!
//! [`LogHub`] keeps, for every session id, a bounded replay buffer of
//! recent [`LogEvent`]s plus a set of listeners.  [`LogHub::emit`]
//! normalizes a message, drops noise and immediate duplicates, appends it
//! to the buffer and synchronously hands it to every listener.  The
//! gateway's SSE endpoint subscribes through [`LogHub::subscribe`], which
//! replays the buffer before live delivery starts.
//!
//! Listeners are released by dropping the [`ListenerGuard`] returned at
//! registration, so a closed client connection unregisters itself.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::LogStreamConfig;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// One structured log line delivered to stream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub session_id: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
}

impl LogEvent {
    fn same_content(&self, other: &LogEvent) -> bool {
        self.level == other.level && self.message == other.message && self.source == other.source
    }
}

/// Callback invoked for every live event.  Errors are logged and do not
/// affect other listeners.
pub type Listener = Arc<dyn Fn(&LogEvent) -> anyhow::Result<()> + Send + Sync>;

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SessionChannel {
    listeners: Vec<(u64, Listener)>,
    buffer: VecDeque<LogEvent>,
}

struct HubInner {
    sessions: Mutex<HashMap<String, SessionChannel>>,
    next_listener_id: AtomicU64,
    capacity: usize,
    max_message_len: usize,
    noise: Vec<Regex>,
}

impl HubInner {
    fn remove_listener(&self, session_id: &str, id: u64) {
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(channel) = sessions.get_mut(session_id) {
            channel.listeners.retain(|(lid, _)| *lid != id);
        }
    }
}

/// Process-wide pub/sub hub keyed by session id.  Cheap to clone.
#[derive(Clone)]
pub struct LogHub {
    inner: Arc<HubInner>,
}

/// Result of [`LogHub::register_listener`]: the replay snapshot taken at
/// registration time and the guard keeping the listener alive.
pub struct Subscription {
    pub history: Vec<LogEvent>,
    pub guard: ListenerGuard,
}

/// Unregisters its listener when dropped.
pub struct ListenerGuard {
    hub: Weak<HubInner>,
    session_id: String,
    id: u64,
}

impl ListenerGuard {
    /// Explicitly unregister (same as dropping the guard).
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_listener(&self.session_id, self.id);
            debug!(session_id = %self.session_id, listener = self.id, "log listener released");
        }
    }
}

impl Default for LogHub {
    fn default() -> Self {
        // Default patterns are known-good, so compilation cannot fail.
        Self::new(&LogStreamConfig::default()).unwrap_or_else(|_| Self::build(50, 500, Vec::new()))
    }
}

impl LogHub {
    /// Build a hub from configuration; fails on an invalid noise pattern.
    pub fn new(cfg: &LogStreamConfig) -> anyhow::Result<Self> {
        let noise = cfg
            .noise_patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| anyhow::anyhow!("invalid noise pattern '{p}': {e}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::build(cfg.buffer_capacity, cfg.max_message_len, noise))
    }

    fn build(capacity: usize, max_message_len: usize, noise: Vec<Regex>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                max_message_len: max_message_len.max(1),
                noise,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionChannel>> {
        // A panicking listener never runs under this lock, but recover
        // anyway rather than poisoning the whole hub.
        match self.inner.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `listener` for `session_id`.
    ///
    /// The returned history is the replay buffer at registration time;
    /// every later event goes to the listener.  Snapshot and registration
    /// happen under one lock, so no event is missed or duplicated.
    pub fn register_listener<F>(&self, session_id: &str, listener: F) -> Subscription
    where
        F: Fn(&LogEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let history = {
            let mut sessions = self.lock();
            let channel = sessions.entry(session_id.to_string()).or_default();
            channel.listeners.push((id, Arc::new(listener)));
            channel.buffer.iter().cloned().collect()
        };
        debug!(session_id, listener = id, "log listener registered");
        Subscription {
            history,
            guard: ListenerGuard {
                hub: Arc::downgrade(&self.inner),
                session_id: session_id.to_string(),
                id,
            },
        }
    }

    /// Subscribe with an unbounded channel.  Delivery never blocks the
    /// emitter; a closed receiver simply makes the send a no-op.
    pub fn subscribe(
        &self,
        session_id: &str,
    ) -> (Vec<LogEvent>, mpsc::UnboundedReceiver<LogEvent>, ListenerGuard) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.register_listener(session_id, move |event| {
            tx.send(event.clone())
                .map_err(|_| anyhow::anyhow!("log stream receiver closed"))
        });
        (sub.history, rx, sub.guard)
    }

    /// Normalize, filter and publish one message.
    ///
    /// Returns the stored event, or `None` when the message was dropped as
    /// noise or coalesced into the previous identical event.
    pub fn emit(
        &self,
        session_id: &str,
        level: LogLevel,
        message: impl AsRef<str>,
        source: Option<&str>,
    ) -> Option<LogEvent> {
        let normalized = crate::utils::collapse_whitespace(message.as_ref());
        if normalized.is_empty() || self.inner.noise.iter().any(|re| re.is_match(&normalized)) {
            return None;
        }
        let event = LogEvent {
            session_id: session_id.to_string(),
            level,
            message: crate::utils::truncate_str(&normalized, self.inner.max_message_len),
            source: source.map(str::to_string),
            timestamp: crate::utils::now_rfc3339(),
        };

        let listeners: Vec<(u64, Listener)> = {
            let mut sessions = self.lock();
            let channel = sessions.entry(session_id.to_string()).or_default();
            if channel.buffer.back().is_some_and(|last| last.same_content(&event)) {
                return None;
            }
            channel.buffer.push_back(event.clone());
            while channel.buffer.len() > self.inner.capacity {
                channel.buffer.pop_front();
            }
            channel.listeners.clone()
        };

        debug!(
            session_id,
            level = level.as_str(),
            source = source.unwrap_or(""),
            message = %event.message,
            "log event"
        );

        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(session_id, listener = id, error = %e, "log listener failed"),
                Err(_) => warn!(session_id, listener = id, "log listener panicked"),
            }
        }

        Some(event)
    }

    pub fn info(&self, session_id: &str, message: impl AsRef<str>, source: &str) -> Option<LogEvent> {
        self.emit(session_id, LogLevel::Info, message, Some(source))
    }

    pub fn warn(&self, session_id: &str, message: impl AsRef<str>, source: &str) -> Option<LogEvent> {
        self.emit(session_id, LogLevel::Warn, message, Some(source))
    }

    pub fn error(&self, session_id: &str, message: impl AsRef<str>, source: &str) -> Option<LogEvent> {
        self.emit(session_id, LogLevel::Error, message, Some(source))
    }

    /// Snapshot of the replay buffer.
    pub fn history(&self, session_id: &str) -> Vec<LogEvent> {
        self.lock()
            .get(session_id)
            .map(|c| c.buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn listener_count(&self, session_id: &str) -> usize {
        self.lock()
            .get(session_id)
            .map(|c| c.listeners.len())
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
