//! In-memory per-session state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Mutable bookkeeping for one session.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Most recent instructions, oldest first, bounded by the store's capacity.
    pub instruction_history: VecDeque<String>,
    /// Context chunks staged for the next instruction.
    pub pending_context: Vec<String>,
    /// Resumable agent conversation handle.
    pub agent_session: Option<String>,
    /// Set once the durable log has been consulted.
    pub history_loaded: bool,
}

impl SessionState {
    pub fn push_instruction(&mut self, instruction: String, capacity: usize) {
        self.instruction_history.push_back(instruction);
        while self.instruction_history.len() > capacity {
            self.instruction_history.pop_front();
        }
    }
}

/// One session's locks.
///
/// `turn` is held for a whole instruction so instructions in the same
/// session run one at a time.  `state` is only held for short critical
/// sections and never across an agent call, so context appends proceed
/// while an instruction is in flight.
#[derive(Debug, Default)]
pub struct SessionHandle {
    pub turn: tokio::sync::Mutex<()>,
    pub state: tokio::sync::Mutex<SessionState>,
}

/// Process-lifetime map of sessions, created lazily on first use.
#[derive(Debug)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
    history_capacity: usize,
}

impl SessionStore {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            history_capacity: history_capacity.max(1),
        }
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    /// Get or create the handle for `session_id`.
    pub fn get(&self, session_id: &str) -> Arc<SessionHandle> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_fifo_bounded() {
        let mut state = SessionState::default();
        for i in 0..7 {
            state.push_instruction(format!("i{i}"), 5);
        }
        let kept: Vec<_> = state.instruction_history.iter().cloned().collect();
        assert_eq!(kept, ["i2", "i3", "i4", "i5", "i6"]);
    }

    #[test]
    fn same_id_returns_same_handle() {
        let store = SessionStore::new(5);
        let a = store.get("s1");
        let b = store.get("s1");
        assert!(Arc::ptr_eq(&a, &b));
        store.get("s2");
        assert_eq!(store.len(), 2);
    }
}
