//! Session orchestrator.
//!
//! Owns every [`ManagedProcess`] keyed by session id and publishes
//! [`SessionEvent`]s to subscribers. All registry mutation and all event
//! emission happen under a single lock, so per-session event order is the
//! order in which the orchestrator observed things.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use protocol::{ServerEvent, SessionId, SessionInfo};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::pty::{ManagedProcess, ProcessSink, ProcessSpec, SPAWN_FAILURE_EXIT_CODE};
use crate::config::SessionConfig;

/// Title given to plain shell sessions.
pub const SHELL_TITLE: &str = "Shell";

/// Notification published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session was created.
    Created(SessionInfo),
    /// A session was destroyed on request.
    Destroyed(SessionId),
    /// A chunk of process output.
    Output { id: SessionId, data: String },
    /// The session's process terminated. Always the last event for `id`.
    Exited { id: SessionId, code: i32 },
}

impl From<SessionEvent> for ServerEvent {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Created(info) => ServerEvent::Created(info),
            SessionEvent::Destroyed(id) => ServerEvent::Destroyed(id),
            SessionEvent::Output { id, data } => ServerEvent::output(id, data),
            SessionEvent::Exited { id, code } => ServerEvent::exited(id, code),
        }
    }
}

struct Entry {
    info: SessionInfo,
    process: ManagedProcess,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<SessionId, Entry>,
    order: Vec<SessionId>,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl Registry {
    fn emit(&mut self, event: SessionEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn remove(&mut self, id: &str) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(entry)
    }

    fn snapshot(&self) -> Vec<SessionInfo> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| entry.info.clone())
            .collect()
    }
}

struct Inner {
    config: SessionConfig,
    home_dir: PathBuf,
    registry: Mutex<Registry>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Routes one process's output and exit back into the registry.
struct EntrySink {
    id: SessionId,
    inner: Weak<Inner>,
}

impl ProcessSink for EntrySink {
    fn output(&self, data: String) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut registry = inner.registry();
        // Destroyed sessions stay silent until their exit.
        if registry.entries.contains_key(&self.id) {
            registry.emit(SessionEvent::Output {
                id: self.id.clone(),
                data,
            });
        }
    }

    fn exited(&self, code: i32) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut registry = inner.registry();
        if registry.remove(&self.id).is_some() {
            tracing::info!(session_id = %self.id, exit_code = code, "Session exited");
        }
        registry.emit(SessionEvent::Exited {
            id: self.id.clone(),
            code,
        });
    }
}

/// Owner of all live sessions.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl SessionOrchestrator {
    /// Creates an orchestrator whose shells start in the user's home directory.
    pub fn new(config: SessionConfig) -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        Self::with_home_dir(config, home_dir)
    }

    /// Creates an orchestrator with an explicit home directory for shells.
    pub fn with_home_dir(config: SessionConfig, home_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                home_dir: home_dir.into(),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Starts a new session and returns its description immediately.
    ///
    /// A non-empty `cwd` runs the agent command there; an empty one runs the
    /// plain shell in the home directory. If the process cannot be started the
    /// session is announced and then reported as exited with code `-1`; it is
    /// never part of [`list`](Self::list).
    pub fn create_session(&self, cwd: &str, title: Option<&str>) -> SessionInfo {
        let config = &self.inner.config;
        let cwd = cwd.trim();

        let (spec, default) = if cwd.is_empty() {
            let spec = ProcessSpec {
                program: config.shell.clone(),
                args: Vec::new(),
                cwd: self.inner.home_dir.clone(),
                cols: config.cols,
                rows: config.rows,
                term: config.term.clone(),
            };
            (spec, SHELL_TITLE.to_string())
        } else {
            let spec = ProcessSpec {
                program: config.agent_command.clone(),
                args: config.agent_args.clone(),
                cwd: PathBuf::from(cwd),
                cols: config.cols,
                rows: config.rows,
                term: config.term.clone(),
            };
            (spec, default_title(cwd))
        };

        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or(default);

        let info = SessionInfo {
            id: Uuid::new_v4().to_string(),
            cwd: spec.cwd.to_string_lossy().into_owned(),
            title,
            created_at: Utc::now(),
        };

        let sink = Arc::new(EntrySink {
            id: info.id.clone(),
            inner: Arc::downgrade(&self.inner),
        });

        let mut registry = self.inner.registry();
        match ManagedProcess::spawn(&info.id, &spec, sink) {
            Ok(process) => {
                registry.entries.insert(
                    info.id.clone(),
                    Entry {
                        info: info.clone(),
                        process,
                    },
                );
                registry.order.push(info.id.clone());
                registry.emit(SessionEvent::Created(info.clone()));
                tracing::info!(session_id = %info.id, title = %info.title, "Session created");
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %info.id,
                    program = %spec.program,
                    error = %e,
                    "Session process failed to start"
                );
                registry.emit(SessionEvent::Created(info.clone()));
                registry.emit(SessionEvent::Exited {
                    id: info.id.clone(),
                    code: SPAWN_FAILURE_EXIT_CODE,
                });
            }
        }

        info
    }

    /// Terminates a session. Returns false if `id` is not live.
    pub fn destroy_session(&self, id: &str) -> bool {
        let mut registry = self.inner.registry();
        let Some(mut entry) = registry.remove(id) else {
            return false;
        };

        if let Err(e) = entry.process.kill() {
            tracing::warn!(session_id = %id, error = %e, "Failed to kill session process");
        }
        registry.emit(SessionEvent::Destroyed(id.to_string()));
        tracing::info!(session_id = %id, "Session destroyed");
        true
    }

    /// Queues input for a session. Returns false if `id` is not live.
    pub fn write(&self, id: &str, data: &[u8]) -> bool {
        let registry = self.inner.registry();
        let Some(entry) = registry.entries.get(id) else {
            return false;
        };

        if let Err(e) = entry.process.write(data) {
            tracing::debug!(session_id = %id, error = %e, "Dropped session input");
        }
        true
    }

    /// Resizes a session's terminal. Returns false if `id` is not live.
    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> bool {
        let registry = self.inner.registry();
        let Some(entry) = registry.entries.get(id) else {
            return false;
        };

        if let Err(e) = entry.process.resize(cols, rows) {
            tracing::warn!(session_id = %id, error = %e, "Failed to resize session");
        }
        true
    }

    /// Directory plain shell sessions start in.
    pub fn home_dir(&self) -> &Path {
        &self.inner.home_dir
    }

    /// Live sessions in creation order.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.inner.registry().snapshot()
    }

    /// Whether `id` is a live session.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.registry().entries.contains_key(id)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.registry().entries.len()
    }

    /// Returns the current sessions together with a stream of every later event.
    pub fn subscribe(&self) -> (Vec<SessionInfo>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.inner.registry();
        registry.subscribers.push(tx);
        (registry.snapshot(), rx)
    }

    /// Kills every live session without a hangup grace period.
    pub fn shutdown(&self) {
        let mut registry = self.inner.registry();
        let ids = std::mem::take(&mut registry.order);
        let count = ids.len();

        for id in ids {
            if let Some(mut entry) = registry.entries.remove(&id) {
                if let Err(e) = entry.process.terminate() {
                    tracing::warn!(session_id = %id, error = %e, "Failed to kill session process");
                }
            }
        }

        tracing::info!(sessions = count, "Orchestrator shut down");
    }
}

/// Last non-empty path segment of `cwd`, or `cwd` itself.
pub fn default_title(cwd: &str) -> String {
    cwd.split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .last()
        .unwrap_or(cwd)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn test_config() -> SessionConfig {
        SessionConfig {
            shell: "/bin/sh".to_string(),
            agent_command: "/bin/sh".to_string(),
            agent_args: Vec::new(),
            cols: 80,
            rows: 24,
            term: "xterm-256color".to_string(),
        }
    }

    fn orchestrator(home: &TempDir) -> SessionOrchestrator {
        SessionOrchestrator::with_home_dir(test_config(), home.path())
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Option<SessionEvent> {
        timeout(Duration::from_secs(5), rx.recv()).await.ok().flatten()
    }

    /// Waits for an event matching `pred`, failing after a few seconds.
    async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<SessionEvent>, pred: F) -> SessionEvent
    where
        F: Fn(&SessionEvent) -> bool,
    {
        loop {
            match next_event(rx).await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream ended without a match"),
            }
        }
    }

    #[test]
    fn test_default_title() {
        assert_eq!(default_title("/home/user/proj"), "proj");
        assert_eq!(default_title("/home/user/proj/"), "proj");
        assert_eq!(default_title("C:\\work\\api"), "api");
        assert_eq!(default_title("relative"), "relative");
        assert_eq!(default_title("/"), "/");
    }

    #[test]
    fn test_event_into_server_event() {
        let event: ServerEvent = SessionEvent::Exited {
            id: "a".to_string(),
            code: 2,
        }
        .into();
        assert_eq!(event, ServerEvent::exited("a", 2));

        let event: ServerEvent = SessionEvent::Destroyed("b".to_string()).into();
        assert_eq!(event, ServerEvent::Destroyed("b".to_string()));
    }

    #[tokio::test]
    async fn test_shell_session_defaults() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);

        let info = orch.create_session("", None);
        assert_eq!(info.title, SHELL_TITLE);
        assert_eq!(info.cwd, home.path().to_string_lossy());
        assert_eq!(orch.home_dir(), home.path());
        assert_eq!(orch.list(), vec![info]);

        orch.shutdown();
    }

    #[tokio::test]
    async fn test_agent_session_title_from_cwd() {
        let home = TempDir::new().unwrap();
        let proj = home.path().join("proj");
        std::fs::create_dir(&proj).unwrap();
        let orch = orchestrator(&home);

        let info = orch.create_session(proj.to_str().unwrap(), None);
        assert_eq!(info.title, "proj");
        assert_eq!(info.cwd, proj.to_string_lossy());

        let titled = orch.create_session(proj.to_str().unwrap(), Some("backend"));
        assert_eq!(titled.title, "backend");

        orch.shutdown();
    }

    #[tokio::test]
    async fn test_list_keeps_insertion_order() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);

        let a = orch.create_session("", Some("a"));
        let b = orch.create_session("", Some("b"));
        let c = orch.create_session("", Some("c"));
        assert_ne!(a.id, b.id);

        assert!(orch.destroy_session(&b.id));
        let ids: Vec<_> = orch.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
        assert_eq!(orch.session_count(), 2);

        orch.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_ids_are_noops() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);
        let (_, mut rx) = orch.subscribe();

        assert!(!orch.write("missing", b"x"));
        assert!(!orch.resize("missing", 10, 10));
        assert!(!orch.destroy_session("missing"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);
        let (_, mut rx) = orch.subscribe();

        let info = orch.create_session("", None);
        assert!(orch.destroy_session(&info.id));
        assert!(!orch.destroy_session(&info.id));
        assert!(!orch.write(&info.id, b"echo late\n"));

        assert_eq!(next_event(&mut rx).await, Some(SessionEvent::Created(info.clone())));

        let mut destroyed = false;
        loop {
            match next_event(&mut rx).await {
                Some(SessionEvent::Destroyed(id)) => {
                    assert_eq!(id, info.id);
                    destroyed = true;
                }
                Some(SessionEvent::Output { .. }) => {
                    assert!(!destroyed, "output after destroy");
                }
                Some(SessionEvent::Exited { id, .. }) => {
                    assert_eq!(id, info.id);
                    break;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(destroyed);
    }

    #[tokio::test]
    async fn test_output_reaches_subscriber() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);
        let (snapshot, mut rx) = orch.subscribe();
        assert!(snapshot.is_empty());

        let info = orch.create_session("", None);
        assert!(orch.write(&info.id, b"echo orch_$((6*7))\n"));

        wait_for(&mut rx, |event| match event {
            SessionEvent::Output { id, data } => *id == info.id && data.contains("orch_42"),
            _ => false,
        })
        .await;

        orch.shutdown();
    }

    #[tokio::test]
    async fn test_exit_removes_session_once() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);
        let (_, mut rx) = orch.subscribe();

        let info = orch.create_session("", None);
        assert!(orch.write(&info.id, b"exit 7\n"));

        let event = wait_for(&mut rx, |e| matches!(e, SessionEvent::Exited { .. })).await;
        assert_eq!(
            event,
            SessionEvent::Exited {
                id: info.id.clone(),
                code: 7
            }
        );
        assert!(orch.list().is_empty());
        assert!(!orch.write(&info.id, b"x"));
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_exit() {
        let home = TempDir::new().unwrap();
        let mut config = test_config();
        config.agent_command = "/nonexistent/panehub-agent".to_string();
        let orch = SessionOrchestrator::with_home_dir(config, home.path());
        let (_, mut rx) = orch.subscribe();

        let info = orch.create_session(home.path().to_str().unwrap(), None);

        assert_eq!(next_event(&mut rx).await, Some(SessionEvent::Created(info.clone())));
        assert_eq!(
            next_event(&mut rx).await,
            Some(SessionEvent::Exited {
                id: info.id.clone(),
                code: SPAWN_FAILURE_EXIT_CODE
            })
        );
        assert!(orch.list().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_snapshot_matches_list() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);
        let a = orch.create_session("", Some("a"));
        let b = orch.create_session("", Some("b"));

        let (snapshot, mut rx) = orch.subscribe();
        assert_eq!(snapshot, vec![a, b]);
        assert!(rx.try_recv().is_err());

        orch.shutdown();
    }

    #[tokio::test]
    async fn test_resize_known_session() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);
        let info = orch.create_session("", None);

        assert!(orch.resize(&info.id, 100, 40));
        orch.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_kills_everything() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);
        let (_, mut rx) = orch.subscribe();

        orch.create_session("", None);
        orch.create_session("", None);
        orch.shutdown();
        assert!(orch.list().is_empty());

        let mut exits = 0;
        while exits < 2 {
            match next_event(&mut rx).await {
                Some(SessionEvent::Exited { .. }) => exits += 1,
                Some(_) => {}
                None => break,
            }
        }
        assert_eq!(exits, 2);
    }

    /// Agent that ignores SIGHUP and records its pid in `pid`.
    fn hangup_immune_orchestrator(home: &TempDir) -> SessionOrchestrator {
        let config = SessionConfig {
            agent_args: vec![
                "-c".to_string(),
                "trap '' HUP; echo $$ > pid; while :; do sleep 0.2; done".to_string(),
            ],
            ..test_config()
        };
        SessionOrchestrator::with_home_dir(config, home.path())
    }

    /// Polls the pid file the agent writes once its trap is installed.
    async fn started_pid(cwd: &Path) -> i32 {
        for _ in 0..100 {
            if let Ok(text) = std::fs::read_to_string(cwd.join("pid")) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("agent never wrote its pid");
    }

    fn is_alive(pid: i32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    #[tokio::test]
    async fn test_destroy_terminates_hangup_immune_process() {
        let home = TempDir::new().unwrap();
        let orch = hangup_immune_orchestrator(&home);
        let (_, mut rx) = orch.subscribe();

        let info = orch.create_session(home.path().to_str().unwrap(), None);
        let pid = started_pid(home.path()).await;

        assert!(orch.destroy_session(&info.id));
        let exited = wait_for(&mut rx, |e| matches!(e, SessionEvent::Exited { .. })).await;
        assert!(matches!(exited, SessionEvent::Exited { id, .. } if id == info.id));
        assert!(!is_alive(pid), "process {} survived destroy", pid);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_hangup_immune_process() {
        let home = TempDir::new().unwrap();
        let orch = hangup_immune_orchestrator(&home);
        let (_, mut rx) = orch.subscribe();

        let info = orch.create_session(home.path().to_str().unwrap(), None);
        let pid = started_pid(home.path()).await;

        orch.shutdown();
        wait_for(&mut rx, |e| matches!(e, SessionEvent::Exited { .. })).await;
        assert!(!is_alive(pid), "process {} survived shutdown", pid);
    }

    #[tokio::test]
    async fn test_contains_tracks_live_sessions() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);

        let info = orch.create_session("", None);
        assert!(orch.contains(&info.id));
        assert!(!orch.contains("ghost"));

        orch.destroy_session(&info.id);
        assert!(!orch.contains(&info.id));
    }
}
