//! Observer fan-out.
//!
//! The hub is the orchestrator's network-facing subscriber. A single pump
//! task drains the orchestrator subscription, keeps a mirror of the live
//! session list, and copies every event into each observer's bounded queue.
//! An observer whose queue is full is disconnected instead of losing events
//! silently; it resynchronizes through the list sent on its next connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use protocol::{ServerEvent, SessionInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::{SessionEvent, SessionOrchestrator};

/// Unique identifier for a connected observer.
pub type ObserverId = u64;

/// Statistics about an observer's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserverStats {
    /// Events queued successfully.
    pub events_sent: u64,
}

/// A registered observer's outbound queue.
struct ObserverHandle {
    tx: mpsc::Sender<ServerEvent>,
    stats: ObserverStats,
}

impl ObserverHandle {
    /// Queues an event without waiting. Returns false if the observer must go.
    fn try_send(&mut self, id: ObserverId, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.events_sent += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    observer_id = id,
                    sent = self.stats.events_sent,
                    "Observer queue full, disconnecting"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(observer_id = id, "Observer channel closed");
                false
            }
        }
    }
}

#[derive(Default)]
struct HubState {
    sessions: Vec<SessionInfo>,
    observers: HashMap<ObserverId, ObserverHandle>,
}

impl HubState {
    fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Created(info) => self.sessions.push(info.clone()),
            SessionEvent::Destroyed(id) | SessionEvent::Exited { id, .. } => {
                self.sessions.retain(|session| &session.id != id)
            }
            SessionEvent::Output { .. } => {}
        }
    }

    fn broadcast(&mut self, event: ServerEvent) {
        self.observers
            .retain(|id, handle| handle.try_send(*id, event.clone()));
    }
}

struct HubInner {
    state: Mutex<HubState>,
    capacity: usize,
    next_id: AtomicU64,
}

impl HubInner {
    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Broadcasts orchestrator events to every connected observer.
#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHub")
            .field("capacity", &self.inner.capacity)
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl RelayHub {
    /// Subscribes to `orchestrator` and starts the pump task.
    ///
    /// The pump stops when `cancel` fires, dropping every observer queue.
    pub fn start(
        orchestrator: &SessionOrchestrator,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (sessions, events) = orchestrator.subscribe();
        let hub = Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState {
                    sessions,
                    observers: HashMap::new(),
                }),
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
            }),
        };

        tokio::spawn(pump(Arc::clone(&hub.inner), events, cancel));
        hub
    }

    /// Registers a new observer.
    ///
    /// The returned queue starts with the current session list; every later
    /// event follows it in order.
    pub fn register(&self) -> (ObserverId, mpsc::Receiver<ServerEvent>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        // One extra slot for the initial list.
        let (tx, rx) = mpsc::channel(self.inner.capacity + 1);

        let mut state = self.inner.state();
        let mut handle = ObserverHandle {
            tx,
            stats: ObserverStats::default(),
        };
        if handle.try_send(id, ServerEvent::List(state.sessions.clone())) {
            state.observers.insert(id, handle);
            tracing::info!(observer_id = id, observers = state.observers.len(), "Observer registered");
        }

        (id, rx)
    }

    /// Removes an observer. Unknown ids are ignored.
    pub fn unregister(&self, id: ObserverId) {
        let mut state = self.inner.state();
        if state.observers.remove(&id).is_some() {
            tracing::info!(observer_id = id, observers = state.observers.len(), "Observer unregistered");
        }
    }

    /// Number of connected observers.
    pub fn observer_count(&self) -> usize {
        self.inner.state().observers.len()
    }

    /// Queue statistics for an observer, if still connected.
    pub fn observer_stats(&self, id: ObserverId) -> Option<ObserverStats> {
        self.inner.state().observers.get(&id).map(|h| h.stats)
    }

    /// Sessions as last reported by the orchestrator.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.state().sessions.clone()
    }
}

async fn pump(
    inner: Arc<HubInner>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let mut state = inner.state();
        state.apply(&event);
        state.broadcast(event.into());
    }

    let mut state = inner.state();
    state.observers.clear();
    tracing::debug!("Relay hub pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn orchestrator(home: &TempDir) -> SessionOrchestrator {
        let config = SessionConfig {
            shell: "/bin/sh".to_string(),
            ..SessionConfig::default()
        };
        SessionOrchestrator::with_home_dir(config, home.path())
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerEvent>) -> Option<ServerEvent> {
        timeout(Duration::from_secs(5), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_new_observer_gets_list_first() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);
        let a = orch.create_session("", Some("a"));
        let b = orch.create_session("", Some("b"));

        let hub = RelayHub::start(&orch, 64, CancellationToken::new());
        let (_, mut rx) = hub.register();

        assert_eq!(recv(&mut rx).await, Some(ServerEvent::List(vec![a, b])));
        assert_eq!(hub.observer_count(), 1);

        orch.shutdown();
    }

    #[tokio::test]
    async fn test_events_broadcast_to_all_observers() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);
        let hub = RelayHub::start(&orch, 64, CancellationToken::new());

        let (_, mut first) = hub.register();
        let (_, mut second) = hub.register();
        assert_eq!(recv(&mut first).await, Some(ServerEvent::List(vec![])));
        assert_eq!(recv(&mut second).await, Some(ServerEvent::List(vec![])));

        let info = orch.create_session("", None);
        assert_eq!(recv(&mut first).await, Some(ServerEvent::Created(info.clone())));
        assert_eq!(recv(&mut second).await, Some(ServerEvent::Created(info.clone())));

        // The mirror follows the orchestrator.
        timeout(Duration::from_secs(1), async {
            while hub.sessions().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(hub.sessions(), vec![info]);

        orch.shutdown();
    }

    #[tokio::test]
    async fn test_slow_observer_is_disconnected() {
        let home = TempDir::new().unwrap();
        // Failed spawns emit created and exited synchronously with no output.
        let config = SessionConfig {
            shell: "/nonexistent/panehub-shell".to_string(),
            ..SessionConfig::default()
        };
        let orch = SessionOrchestrator::with_home_dir(config, home.path());
        let hub = RelayHub::start(&orch, 4, CancellationToken::new());

        let (slow_id, mut slow) = hub.register();
        let (fast_id, mut fast) = hub.register();
        assert!(matches!(recv(&mut fast).await, Some(ServerEvent::List(_))));

        for _ in 0..5 {
            let info = orch.create_session("", None);
            assert_eq!(recv(&mut fast).await, Some(ServerEvent::Created(info.clone())));
            assert_eq!(recv(&mut fast).await, Some(ServerEvent::exited(info.id, -1)));
        }

        assert!(hub.observer_stats(fast_id).is_some());
        assert!(hub.observer_stats(slow_id).is_none());
        assert_eq!(hub.observer_count(), 1);

        // The slow queue holds what fit, then reports closure.
        let mut drained = 0;
        while recv(&mut slow).await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, 5);
    }

    #[tokio::test]
    async fn test_unregister() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);
        let hub = RelayHub::start(&orch, 8, CancellationToken::new());

        let (id, _rx) = hub.register();
        assert!(hub.observer_stats(id).is_some());
        hub.unregister(id);
        hub.unregister(id);
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_closes_observer_queues() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);
        let cancel = CancellationToken::new();
        let hub = RelayHub::start(&orch, 8, cancel.clone());

        let (_, mut rx) = hub.register();
        assert!(matches!(recv(&mut rx).await, Some(ServerEvent::List(_))));

        cancel.cancel();
        assert_eq!(recv(&mut rx).await, None);
        assert_eq!(hub.observer_count(), 0);
    }
}
