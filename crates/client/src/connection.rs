//! Websocket connection to the daemon relay.
//!
//! The connection authenticates with a bearer token, forwards
//! [`ClientCommand`]s and surfaces every [`ServerEvent`] through an event
//! channel. Dropped connections are retried with exponential backoff; each
//! successful reconnect starts with a fresh `list` event, which is how the
//! directory re-synchronizes.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::messages::{CreateSession, SessionInput, SessionResize};
use protocol::{ClientCommand, ProtocolError, ServerEvent, SessionId};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Default reconnection settings.
const INITIAL_BACKOFF_MS: u64 = 1_000;
const MAX_BACKOFF_MS: u64 = 30_000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Consecutive reconnect attempts before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

const CHANNEL_CAPACITY: usize = 256;

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors from the relay connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The relay URL cannot be used.
    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),

    /// The token cannot be placed in a header.
    #[error("access token contains invalid characters")]
    InvalidToken,

    /// The relay refused the token.
    #[error("relay rejected the access token")]
    Unauthorized,

    /// Transport failure.
    #[error("websocket error: {0}")]
    WebSocket(Box<WsError>),

    /// No connection is currently established.
    #[error("not connected to the relay")]
    NotConnected,

    /// Encoding a command failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<WsError> for ConnectionError {
    fn from(e: WsError) -> Self {
        match e {
            WsError::Http(ref response) if response.status() == StatusCode::UNAUTHORIZED => {
                ConnectionError::Unauthorized
            }
            other => ConnectionError::WebSocket(Box::new(other)),
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Waiting to retry after a failure or disconnect.
    Reconnecting,
}

/// Events emitted by the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// An event from the relay.
    Relay(ServerEvent),
    /// The relay refused the token; no further attempts are made.
    Unauthorized,
    /// A connection attempt failed.
    Error { message: String },
}

/// Configuration for [`RelayConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Relay address (`ws://`, `wss://`, `http://` or `https://`).
    pub url: String,
    /// Bearer token presented during the handshake.
    pub token: String,
    /// Initial backoff duration for reconnection.
    pub initial_backoff: Duration,
    /// Maximum backoff duration for reconnection.
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to reconnect after a failure or disconnect.
    pub auto_reconnect: bool,
    /// Consecutive attempts before giving up; `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl ConnectionConfig {
    /// Creates a configuration for `url` with default backoff settings.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            backoff_multiplier: BACKOFF_MULTIPLIER,
            auto_reconnect: true,
            max_reconnect_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
        }
    }

    /// Sets whether to automatically reconnect.
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Sets the initial backoff duration.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Sets the maximum backoff duration.
    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Sets the attempt limit.
    pub fn with_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Websocket URL, with `http(s)` mapped to `ws(s)`.
    pub fn websocket_url(&self) -> Result<Url, ConnectionError> {
        let mut url =
            Url::parse(&self.url).map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(ConnectionError::InvalidUrl(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };
        if url.scheme() != scheme {
            url.set_scheme(scheme)
                .map_err(|()| ConnectionError::InvalidUrl(self.url.clone()))?;
        }
        Ok(url)
    }
}

/// Next backoff after `current`, capped at `max`.
pub fn next_backoff(current: Duration, multiplier: f64, max: Duration) -> Duration {
    let next = current.as_secs_f64() * multiplier;
    if !next.is_finite() || next >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(next)
    }
}

struct ClientState {
    connection_state: ConnectionState,
    message_tx: Option<mpsc::Sender<ClientCommand>>,
    current_backoff: Duration,
    attempts: u32,
}

/// Reconnecting relay client.
///
/// A connection is started once with [`RelayConnection::start`] and ends for
/// good after [`RelayConnection::disconnect`], an auth rejection, or when the
/// attempt limit is exhausted.
pub struct RelayConnection {
    config: ConnectionConfig,
    state: Arc<RwLock<ClientState>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    cancel: CancellationToken,
}

impl RelayConnection {
    /// Creates an idle connection.
    pub fn new(config: ConnectionConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let state = ClientState {
            connection_state: ConnectionState::Disconnected,
            message_tx: None,
            current_backoff: config.initial_backoff,
            attempts: 0,
        };

        Self {
            config,
            state: Arc::new(RwLock::new(state)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            cancel: CancellationToken::new(),
        }
    }

    /// Takes the event receiver. Returns `None` after the first call.
    pub fn events(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.state.read().await.connection_state
    }

    /// Runs the connection loop in the background.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let connection = Arc::clone(self);
        tokio::spawn(async move { connection.run_connection_loop().await })
    }

    /// Closes the connection and stops reconnecting.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Sends a command over the current connection.
    pub async fn send(&self, command: ClientCommand) -> Result<(), ConnectionError> {
        let tx = self
            .state
            .read()
            .await
            .message_tx
            .clone()
            .ok_or(ConnectionError::NotConnected)?;
        tx.send(command)
            .await
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Requests a new session. An empty `cwd` starts a plain shell.
    pub async fn create_session(
        &self,
        cwd: impl Into<String>,
        title: Option<String>,
    ) -> Result<(), ConnectionError> {
        self.send(ClientCommand::Create(CreateSession {
            cwd: cwd.into(),
            title,
        }))
        .await
    }

    /// Sends input to a session.
    pub async fn write(
        &self,
        session_id: impl Into<SessionId>,
        data: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        self.send(ClientCommand::Input(SessionInput {
            terminal_id: session_id.into(),
            data: data.into(),
        }))
        .await
    }

    /// Resizes a session's terminal.
    pub async fn resize(
        &self,
        session_id: impl Into<SessionId>,
        cols: u16,
        rows: u16,
    ) -> Result<(), ConnectionError> {
        self.send(ClientCommand::Resize(SessionResize {
            terminal_id: session_id.into(),
            cols,
            rows,
        }))
        .await
    }

    /// Terminates a session.
    pub async fn destroy(&self, session_id: impl Into<SessionId>) -> Result<(), ConnectionError> {
        self.send(ClientCommand::Destroy(session_id.into())).await
    }

    async fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.event_tx.send(event).await {
            tracing::debug!(error = %e, "Event receiver dropped");
        }
    }

    /// Updates the connection state and emits an event on change.
    async fn set_state(&self, new_state: ConnectionState) {
        {
            let mut state = self.state.write().await;
            if state.connection_state == new_state {
                return;
            }
            state.connection_state = new_state;
        }
        self.emit(ConnectionEvent::StateChanged(new_state)).await;
    }

    async fn connect_internal(&self) -> Result<RelayStream, ConnectionError> {
        let url = self.config.websocket_url()?;
        tracing::info!(url = %url, "Connecting to relay");

        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.token))
            .map_err(|_| ConnectionError::InvalidToken)?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);

        let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
        Ok(ws)
    }

    async fn run_connection_loop(self: Arc<Self>) {
        while !self.cancel.is_cancelled() {
            self.set_state(ConnectionState::Connecting).await;

            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connect_internal() => result,
            };

            match attempt {
                Ok(ws) => {
                    {
                        let mut state = self.state.write().await;
                        state.current_backoff = self.config.initial_backoff;
                        state.attempts = 0;
                    }
                    self.run_session(ws).await;
                }
                Err(ConnectionError::Unauthorized) => {
                    tracing::warn!("Relay rejected the access token");
                    self.emit(ConnectionEvent::Unauthorized).await;
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Relay connection failed");
                    self.emit(ConnectionEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                }
            }

            let backoff = {
                let mut state = self.state.write().await;
                let within_limit = self
                    .config
                    .max_reconnect_attempts
                    .is_none_or(|max| state.attempts < max);
                if !self.config.auto_reconnect || !within_limit || self.cancel.is_cancelled() {
                    break;
                }
                state.attempts += 1;
                let backoff = state.current_backoff;
                state.current_backoff = next_backoff(
                    backoff,
                    self.config.backoff_multiplier,
                    self.config.max_backoff,
                );
                backoff
            };

            self.set_state(ConnectionState::Reconnecting).await;
            tracing::info!(backoff = ?backoff, "Reconnecting to relay");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Pumps one established connection until it ends.
    async fn run_session(&self, ws: RelayStream) {
        let (mut sink, mut stream) = ws.split();
        let (message_tx, mut message_rx) = mpsc::channel::<ClientCommand>(CHANNEL_CAPACITY);
        self.state.write().await.message_tx = Some(message_tx);
        self.set_state(ConnectionState::Connected).await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
                Some(command) = message_rx.recv() => {
                    let text = match command.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to encode command");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        tracing::warn!(error = %e, "Failed to send command");
                        break;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => match ServerEvent::from_json(&text) {
                        Ok(event) => self.emit(ConnectionEvent::Relay(event)).await,
                        Err(e) => tracing::warn!(error = %e, "Ignoring malformed relay event"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => {
                        tracing::info!("Relay closed the connection");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Relay connection lost");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }

        self.state.write().await.message_tx = None;
    }
}
