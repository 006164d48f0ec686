//! Client-side session directory.
//!
//! Mirrors the daemon's session list from relay events, tracks which session
//! is focused, and keeps the grid layout in step with the list.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use protocol::{ServerEvent, SessionId, SessionInfo};

use crate::layout::{GridLayout, LayoutEngine};

/// Receives a session's output text, e.g. a terminal emulator widget.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Cached session list plus focus, layout and output routing.
#[derive(Clone, Default)]
pub struct SessionDirectory {
    sessions: Vec<SessionInfo>,
    active: Option<SessionId>,
    layout: LayoutEngine,
    sinks: HashMap<SessionId, OutputSink>,
}

impl fmt::Debug for SessionDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDirectory")
            .field("sessions", &self.sessions)
            .field("active", &self.active)
            .field("layout", &self.layout)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl SessionDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions in list order.
    pub fn sessions(&self) -> &[SessionInfo] {
        &self.sessions
    }

    /// Looks up a session by id.
    pub fn get(&self, id: &str) -> Option<&SessionInfo> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// The focused session, if any.
    pub fn active(&self) -> Option<&SessionInfo> {
        self.active.as_deref().and_then(|id| self.get(id))
    }

    /// Id of the focused session.
    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Current grid layout.
    pub fn layout(&self) -> Option<&GridLayout> {
        self.layout.layout()
    }

    /// Layout engine, for drag and resize handling.
    pub fn layout_engine(&self) -> &LayoutEngine {
        &self.layout
    }

    /// Mutable layout engine.
    pub fn layout_engine_mut(&mut self) -> &mut LayoutEngine {
        &mut self.layout
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.sessions.iter().position(|s| s.id == id)
    }

    /// Replaces the list and rebuilds the layout.
    ///
    /// The focused session stays focused if it is still listed; otherwise the
    /// first session takes focus. Sinks of sessions no longer listed are
    /// dropped.
    pub fn set_sessions(&mut self, sessions: Vec<SessionInfo>) {
        let mut unique: Vec<SessionInfo> = Vec::with_capacity(sessions.len());
        for session in sessions {
            if !unique.iter().any(|s| s.id == session.id) {
                unique.push(session);
            }
        }
        self.sessions = unique;

        let still_listed = self
            .active
            .as_deref()
            .is_some_and(|id| self.index_of(id).is_some());
        if !still_listed {
            self.active = self.sessions.first().map(|s| s.id.clone());
        }

        let sessions = &self.sessions;
        self.sinks
            .retain(|id, _| sessions.iter().any(|s| &s.id == id));

        let ids: Vec<&str> = self.sessions.iter().map(|s| s.id.as_str()).collect();
        self.layout.initialize_layout(&ids);

        tracing::debug!(count = self.sessions.len(), "Session list replaced");
    }

    /// Appends a session and focuses it. Known ids are ignored.
    pub fn add_session(&mut self, session: SessionInfo) {
        if self.index_of(&session.id).is_some() {
            tracing::debug!(session_id = %session.id, "Session already listed");
            return;
        }
        self.layout.add_cell(&session.id);
        self.active = Some(session.id.clone());
        self.sessions.push(session);
    }

    /// Removes a session, its cell and its sink.
    ///
    /// If it was focused, focus moves to the session now at the same index,
    /// or the last one.
    pub fn remove_session(&mut self, id: &str) {
        let Some(index) = self.index_of(id) else {
            return;
        };
        self.sessions.remove(index);
        self.layout.remove_cell(id);
        self.sinks.remove(id);

        if self.active.as_deref() == Some(id) {
            self.active = if self.sessions.is_empty() {
                None
            } else {
                let next = index.min(self.sessions.len() - 1);
                Some(self.sessions[next].id.clone())
            };
        }
    }

    /// Focuses a session; unknown ids are ignored.
    pub fn set_active(&mut self, id: &str) {
        if self.index_of(id).is_some() {
            self.active = Some(id.to_string());
        }
    }

    /// Focuses the next session, wrapping to the first.
    pub fn next(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let next = match self.active.as_deref().and_then(|id| self.index_of(id)) {
            Some(i) => (i + 1) % self.sessions.len(),
            None => 0,
        };
        self.active = Some(self.sessions[next].id.clone());
    }

    /// Focuses the previous session, wrapping to the last.
    pub fn prev(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let len = self.sessions.len();
        let prev = match self.active.as_deref().and_then(|id| self.index_of(id)) {
            Some(i) => (i + len - 1) % len,
            None => len - 1,
        };
        self.active = Some(self.sessions[prev].id.clone());
    }

    /// Moves the session at `from` to position `to` (clamped to the end).
    ///
    /// Returns `false` if `from` is out of range or the move is a no-op.
    pub fn reorder(&mut self, from: usize, to: usize) -> bool {
        if from >= self.sessions.len() || from == to {
            return false;
        }
        let session = self.sessions.remove(from);
        let to = to.min(self.sessions.len());
        self.sessions.insert(to, session);
        true
    }

    /// Routes a session's output to `sink`, replacing any previous sink.
    pub fn register_output(&mut self, id: impl Into<SessionId>, sink: OutputSink) {
        self.sinks.insert(id.into(), sink);
    }

    /// Stops routing a session's output.
    pub fn unregister_output(&mut self, id: &str) {
        self.sinks.remove(id);
    }

    /// Applies one relay event.
    pub fn apply(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::List(sessions) => self.set_sessions(sessions),
            ServerEvent::Created(session) => self.add_session(session),
            ServerEvent::Destroyed(id) => self.remove_session(&id),
            ServerEvent::Exited(exit) => {
                tracing::debug!(
                    session_id = %exit.terminal_id,
                    exit_code = exit.exit_code,
                    "Session exited"
                );
                self.remove_session(&exit.terminal_id);
            }
            ServerEvent::Output(output) => match self.sinks.get(&output.terminal_id) {
                Some(sink) => sink(&output.data),
                None => {
                    tracing::trace!(session_id = %output.terminal_id, "No output sink registered")
                }
            },
            ServerEvent::Error(error) => {
                tracing::warn!(message = %error.message, "Relay reported an error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    fn info(id: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            cwd: "/tmp".to_string(),
            title: id.to_uppercase(),
            created_at: Utc::now(),
        }
    }

    fn ids(dir: &SessionDirectory) -> Vec<&str> {
        dir.sessions().iter().map(|s| s.id.as_str()).collect()
    }

    fn directory(names: &[&str]) -> SessionDirectory {
        let mut dir = SessionDirectory::new();
        dir.set_sessions(names.iter().map(|n| info(n)).collect());
        dir
    }

    #[test]
    fn test_set_sessions_focuses_first_and_builds_layout() {
        let dir = directory(&["a", "b", "c"]);
        assert_eq!(dir.active_id(), Some("a"));
        assert_eq!(dir.layout().unwrap().cell_count(), 3);
    }

    #[test]
    fn test_set_sessions_keeps_focus_when_still_listed() {
        let mut dir = directory(&["a", "b", "c"]);
        dir.set_active("c");
        dir.set_sessions(vec![info("b"), info("c")]);
        assert_eq!(dir.active_id(), Some("c"));

        dir.set_sessions(vec![info("x"), info("b")]);
        assert_eq!(dir.active_id(), Some("x"));
    }

    #[test]
    fn test_set_sessions_empty_clears_everything() {
        let mut dir = directory(&["a"]);
        dir.set_sessions(Vec::new());
        assert!(dir.active().is_none());
        assert!(dir.layout().is_none());
    }

    #[test]
    fn test_add_session_focuses_and_ignores_duplicates() {
        let mut dir = directory(&["a"]);
        dir.add_session(info("b"));
        assert_eq!(dir.active_id(), Some("b"));
        assert_eq!(ids(&dir), vec!["a", "b"]);

        dir.set_active("a");
        dir.add_session(info("b"));
        assert_eq!(ids(&dir), vec!["a", "b"]);
        assert_eq!(dir.active_id(), Some("a"));
        assert_eq!(dir.layout().unwrap().cell_count(), 2);
    }

    #[test]
    fn test_remove_active_focuses_neighbour() {
        let mut dir = directory(&["a", "b", "c"]);
        dir.set_active("b");
        dir.remove_session("b");
        assert_eq!(dir.active_id(), Some("c"));

        dir.remove_session("c");
        assert_eq!(dir.active_id(), Some("a"));

        dir.remove_session("a");
        assert_eq!(dir.active_id(), None);
        assert!(dir.layout().is_none());
    }

    #[test]
    fn test_remove_inactive_keeps_focus() {
        let mut dir = directory(&["a", "b"]);
        dir.remove_session("b");
        assert_eq!(dir.active_id(), Some("a"));
        dir.remove_session("missing");
        assert_eq!(ids(&dir), vec!["a"]);
    }

    #[test]
    fn test_set_active_ignores_unknown() {
        let mut dir = directory(&["a", "b"]);
        dir.set_active("zzz");
        assert_eq!(dir.active_id(), Some("a"));
    }

    #[test]
    fn test_next_and_prev_wrap() {
        let mut dir = directory(&["a", "b", "c"]);
        dir.next();
        assert_eq!(dir.active_id(), Some("b"));
        dir.next();
        dir.next();
        assert_eq!(dir.active_id(), Some("a"));
        dir.prev();
        assert_eq!(dir.active_id(), Some("c"));

        let mut empty = SessionDirectory::new();
        empty.next();
        empty.prev();
        assert_eq!(empty.active_id(), None);
    }

    #[test]
    fn test_reorder() {
        let mut dir = directory(&["a", "b", "c"]);
        assert!(dir.reorder(0, 2));
        assert_eq!(ids(&dir), vec!["b", "c", "a"]);
        assert!(dir.reorder(2, 99));
        assert_eq!(ids(&dir), vec!["b", "c", "a"]);
        assert!(dir.reorder(2, 0));
        assert_eq!(ids(&dir), vec!["a", "b", "c"]);
        assert!(!dir.reorder(5, 0));
        assert!(!dir.reorder(1, 1));
    }

    #[test]
    fn test_apply_routes_output_to_sink() {
        let mut dir = directory(&["a", "b"]);
        let received = Arc::new(Mutex::new(String::new()));
        let sink = received.clone();
        dir.register_output(
            "a",
            Arc::new(move |data: &str| sink.lock().unwrap().push_str(data)),
        );

        dir.apply(ServerEvent::output("a", "hello "));
        dir.apply(ServerEvent::output("b", "ignored"));
        dir.apply(ServerEvent::output("a", "world"));
        assert_eq!(received.lock().unwrap().as_str(), "hello world");

        dir.unregister_output("a");
        dir.apply(ServerEvent::output("a", "!"));
        assert_eq!(received.lock().unwrap().as_str(), "hello world");
    }

    #[test]
    fn test_apply_lifecycle_events() {
        let mut dir = SessionDirectory::new();
        dir.apply(ServerEvent::List(vec![info("a")]));
        dir.apply(ServerEvent::Created(info("b")));
        assert_eq!(ids(&dir), vec!["a", "b"]);
        assert_eq!(dir.active_id(), Some("b"));

        dir.apply(ServerEvent::Destroyed("a".to_string()));
        assert_eq!(ids(&dir), vec!["b"]);

        dir.apply(ServerEvent::exited("b", 0));
        assert!(dir.sessions().is_empty());

        // Exit after destroy is absorbed.
        dir.apply(ServerEvent::exited("b", 0));
        dir.apply(ServerEvent::error("bad frame"));
        assert!(dir.sessions().is_empty());
    }

    #[test]
    fn test_removed_session_drops_sink() {
        let mut dir = directory(&["a"]);
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        dir.register_output("a", Arc::new(move |_: &str| *counter.lock().unwrap() += 1));

        dir.remove_session("a");
        dir.add_session(info("a"));
        dir.apply(ServerEvent::output("a", "x"));
        assert_eq!(*hits.lock().unwrap(), 0);
    }
}
