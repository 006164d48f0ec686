//! Daemon service lifecycle.
//!
//! [`DaemonService`] owns the session orchestrator and wires it to the
//! websocket relay and the local control socket. It is the only place that
//! knows how the pieces are started and torn down.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use anyhow::{Context, Result};
use base64::Engine;
use protocol::{generate_secret, TokenAuthority, SECRET_LENGTH};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::ipc::{self, IpcHandler, IpcRequest, IpcResponse, IpcServer};
use crate::relay::{RelayHub, RelayServer};
use crate::router::CommandRouter;
use crate::session::SessionOrchestrator;

/// Service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Initial state, not started.
    Stopped,
    /// Binding listeners.
    Starting,
    /// Accepting observers and control requests.
    Running,
    /// Tearing down sessions.
    ShuttingDown,
}

/// Events emitted by the service.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// Lifecycle state changed.
    StateChanged(ServiceState),
    /// A control client asked the daemon to stop.
    StopRequested,
}

/// The running daemon: orchestrator, relay and control socket.
pub struct DaemonService {
    config: Config,
    authority: Arc<TokenAuthority>,
    orchestrator: SessionOrchestrator,
    socket_path: Option<PathBuf>,
    state: Arc<RwLock<ServiceState>>,
    hub: Option<RelayHub>,
    local_addr: Option<SocketAddr>,
    started_at: Option<Instant>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<ServiceEvent>,
}

impl DaemonService {
    /// Creates the service, loading or generating the token secret.
    pub fn new(config: Config) -> Result<Self> {
        let authority = load_token_authority(&config)?;
        let orchestrator = SessionOrchestrator::new(config.session.clone());
        Ok(Self::with_parts(config, authority, orchestrator))
    }

    /// Creates the service from already-built parts.
    pub fn with_parts(
        config: Config,
        authority: TokenAuthority,
        orchestrator: SessionOrchestrator,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config,
            authority: Arc::new(authority),
            orchestrator,
            socket_path: Some(ipc::get_socket_path()),
            state: Arc::new(RwLock::new(ServiceState::Stopped)),
            hub: None,
            local_addr: None,
            started_at: None,
            shutdown_token: CancellationToken::new(),
            event_tx,
        }
    }

    /// Overrides where the control socket is bound; `None` disables it.
    pub fn with_socket_path(mut self, path: Option<PathBuf>) -> Self {
        self.socket_path = path;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        *self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Returns a receiver for service events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.event_tx.subscribe()
    }

    /// The session orchestrator.
    pub fn orchestrator(&self) -> &SessionOrchestrator {
        &self.orchestrator
    }

    /// The token authority observers authenticate against.
    pub fn authority(&self) -> &TokenAuthority {
        &self.authority
    }

    /// Address the relay is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Seconds since `start` completed.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.map_or(0, |t| t.elapsed().as_secs())
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.orchestrator.session_count()
    }

    /// Number of connected relay observers.
    pub fn observer_count(&self) -> usize {
        self.hub.as_ref().map_or(0, RelayHub::observer_count)
    }

    /// Token cancelled when the service stops, including on an IPC `Stop`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Binds the relay and the control socket and starts serving.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *state != ServiceState::Stopped {
                anyhow::bail!("Service is already running");
            }
            *state = ServiceState::Starting;
        }
        self.emit(ServiceEvent::StateChanged(ServiceState::Starting));

        let run_token = self.shutdown_token.child_token();
        if let Err(e) = self.bind_all(&run_token).await {
            run_token.cancel();
            self.set_state(ServiceState::Stopped);
            return Err(e);
        }

        self.started_at = Some(Instant::now());
        self.set_state(ServiceState::Running);
        info!(
            addr = ?self.local_addr,
            sessions = self.session_count(),
            "PaneHub daemon running"
        );
        Ok(())
    }

    async fn bind_all(&mut self, run_token: &CancellationToken) -> Result<()> {
        let addr = self.config.bind_addr()?;

        let hub = RelayHub::start(
            &self.orchestrator,
            self.config.relay.observer_queue,
            run_token.child_token(),
        );
        let router = CommandRouter::new(self.orchestrator.clone());
        let server = RelayServer::bind(addr, hub.clone(), router, Arc::clone(&self.authority))
            .await
            .context("Failed to start relay")?;
        let local_addr = server.local_addr()?;
        tokio::spawn(server.run(run_token.child_token()));

        if let Some(path) = &self.socket_path {
            let ipc_server = IpcServer::bind(path)
                .await
                .with_context(|| format!("Failed to bind control socket: {}", path.display()))?;
            let handler = ControlHandler {
                orchestrator: self.orchestrator.clone(),
                hub: hub.clone(),
                bind_addr: local_addr,
                started_at: Instant::now(),
                shutdown: self.shutdown_token.clone(),
                event_tx: self.event_tx.clone(),
            };
            tokio::spawn(ipc_server.serve(Arc::new(handler), run_token.child_token()));
            debug!(path = %path.display(), "Control socket listening");
        }

        self.hub = Some(hub);
        self.local_addr = Some(local_addr);
        Ok(())
    }

    /// Stops listeners and kills every session.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *state == ServiceState::Stopped || *state == ServiceState::ShuttingDown {
                return Ok(());
            }
            *state = ServiceState::ShuttingDown;
        }
        self.emit(ServiceEvent::StateChanged(ServiceState::ShuttingDown));

        info!(sessions = self.session_count(), "Stopping PaneHub daemon");
        self.shutdown_token.cancel();
        self.orchestrator.shutdown();

        // Let the listener tasks observe cancellation and release their sockets.
        tokio::task::yield_now().await;

        self.hub = None;
        self.started_at = None;
        self.set_state(ServiceState::Stopped);
        info!("PaneHub daemon stopped");
        Ok(())
    }

    fn set_state(&self, new_state: ServiceState) {
        *self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = new_state;
        self.emit(ServiceEvent::StateChanged(new_state));
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Answers control-socket requests against the live service.
struct ControlHandler {
    orchestrator: SessionOrchestrator,
    hub: RelayHub,
    bind_addr: SocketAddr,
    started_at: Instant,
    shutdown: CancellationToken,
    event_tx: broadcast::Sender<ServiceEvent>,
}

impl IpcHandler for ControlHandler {
    fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: !self.shutdown.is_cancelled(),
                uptime_secs: self.started_at.elapsed().as_secs(),
                session_count: self.orchestrator.session_count(),
                observer_count: self.hub.observer_count(),
                bind_addr: self.bind_addr.to_string(),
            },
            IpcRequest::Stop => {
                info!("Stop requested over control socket");
                let _ = self.event_tx.send(ServiceEvent::StopRequested);
                self.shutdown.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.orchestrator.list(),
            },
            IpcRequest::DestroySession { session_id } => {
                if self.orchestrator.destroy_session(&session_id) {
                    IpcResponse::SessionDestroyed { session_id }
                } else {
                    IpcResponse::Error {
                        message: format!("session not found: {}", session_id),
                    }
                }
            }
        }
    }
}

/// Builds the token authority from the persisted secret and configured TTL.
pub fn load_token_authority(config: &Config) -> Result<TokenAuthority> {
    let secret = load_or_generate_secret(&config.token_secret_path())?;
    Ok(TokenAuthority::new(&secret, config.security.token_ttl_secs))
}

/// Reads the base64 token secret at `path`, generating it on first use.
pub fn load_or_generate_secret(path: &Path) -> Result<Vec<u8>> {
    let engine = base64::engine::general_purpose::STANDARD;

    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read token secret: {}", path.display()))?;
        let secret = engine
            .decode(text.trim())
            .with_context(|| format!("Token secret is not valid base64: {}", path.display()))?;
        if secret.len() < SECRET_LENGTH {
            anyhow::bail!(
                "Invalid token secret: expected at least {} bytes, got {}",
                SECRET_LENGTH,
                secret.len()
            );
        }
        return Ok(secret);
    }

    let secret = generate_secret();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    write_private(path, engine.encode(secret).as_bytes())
        .with_context(|| format!("Failed to write token secret: {}", path.display()))?;

    info!(path = %path.display(), "Generated new token secret");
    Ok(secret.to_vec())
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    file.write_all(b"\n")
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    tracing::warn!(path = %path.display(), "Token secret permissions are not restricted on this platform");
    std::fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcClient;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().join("data");
        config.network.bind_addr = "127.0.0.1:0".to_string();
        config.session.shell = "/bin/sh".to_string();
        config
    }

    fn create_test_service(temp_dir: &TempDir) -> DaemonService {
        let config = create_test_config(temp_dir);
        DaemonService::new(config)
            .unwrap()
            .with_socket_path(Some(temp_dir.path().join("run").join("daemon.sock")))
    }

    #[test]
    fn test_secret_generated_then_reloaded() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data").join("token.key");

        let first = load_or_generate_secret(&path).unwrap();
        assert_eq!(first.len(), SECRET_LENGTH);
        assert!(path.exists());

        let second = load_or_generate_secret(&path).unwrap();
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_short_secret_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("token.key");
        std::fs::write(&path, "c2hvcnQ=\n").unwrap();

        let err = load_or_generate_secret(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid token secret"));
    }

    #[test]
    fn test_tokens_survive_restart() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);

        let token = load_token_authority(&config).unwrap().issue().unwrap();
        let reloaded = load_token_authority(&config).unwrap();
        assert!(reloaded.verify(&token).is_ok());
    }

    #[tokio::test]
    async fn test_service_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let mut service = create_test_service(&temp_dir);
        let mut events = service.subscribe();

        assert_eq!(service.state(), ServiceState::Stopped);
        service.start().await.unwrap();
        assert_eq!(service.state(), ServiceState::Running);
        assert!(service.local_addr().unwrap().port() > 0);
        assert!(service.start().await.is_err());

        service.stop().await.unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(service.shutdown_token().is_cancelled());

        let mut states = Vec::new();
        while let Ok(ServiceEvent::StateChanged(state)) = events.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            vec![
                ServiceState::Starting,
                ServiceState::Running,
                ServiceState::ShuttingDown,
                ServiceState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let mut service = create_test_service(&temp_dir);
        service.stop().await.unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_control_socket_requests() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("run").join("daemon.sock");
        let mut service = create_test_service(&temp_dir);
        service.start().await.unwrap();

        let info = service.orchestrator().create_session("", None);
        let mut client = IpcClient::connect(&socket_path).await.unwrap();

        match client.status().await.unwrap() {
            IpcResponse::Status {
                running,
                session_count,
                observer_count,
                bind_addr,
                ..
            } => {
                assert!(running);
                assert_eq!(session_count, 1);
                assert_eq!(observer_count, 0);
                assert_eq!(bind_addr, service.local_addr().unwrap().to_string());
            }
            other => panic!("Expected Status response, got {:?}", other),
        }

        match client.list_sessions().await.unwrap() {
            IpcResponse::Sessions { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].id, info.id);
            }
            other => panic!("Expected Sessions response, got {:?}", other),
        }

        assert_eq!(
            client.destroy_session(info.id.clone()).await.unwrap(),
            IpcResponse::SessionDestroyed {
                session_id: info.id.clone()
            }
        );
        assert!(matches!(
            client.destroy_session(info.id).await.unwrap(),
            IpcResponse::Error { .. }
        ));
        assert_eq!(service.session_count(), 0);

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_ipc_stop_cancels_shutdown_token() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("run").join("daemon.sock");
        let mut service = create_test_service(&temp_dir);
        service.start().await.unwrap();
        let token = service.shutdown_token();

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert_eq!(client.stop().await.unwrap(), IpcResponse::Stopping);

        tokio::time::timeout(std::time::Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        service.stop().await.unwrap();
        assert_eq!(service.session_count(), 0);
    }

    #[tokio::test]
    async fn test_start_fails_on_bad_bind_addr() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.network.bind_addr = "not an address".to_string();
        let mut service = DaemonService::new(config).unwrap().with_socket_path(None);

        assert!(service.start().await.is_err());
        assert_eq!(service.state(), ServiceState::Stopped);
    }
}
