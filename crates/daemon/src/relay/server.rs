//! Authenticated websocket listener.
//!
//! Every connection must carry a bearer token in its upgrade request, either
//! as `Authorization: Bearer <token>` or as a `token` query parameter. The
//! token is checked inside the handshake callback, so a rejected peer gets a
//! plain HTTP 401 and never sees a single event.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::{ProtocolError, ServerEvent, TokenAuthority, TokenClaims};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hub::{ObserverId, RelayHub};
use crate::router::CommandRouter;

/// Errors raised by the relay listener.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listen address could not be bound.
    #[error("failed to bind relay on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Socket-level failure.
    #[error("relay I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Websocket protocol failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// An event could not be encoded.
    #[error("encoding error: {0}")]
    Encode(#[from] ProtocolError),
}

/// Reason a connection was refused during the handshake.
#[derive(Debug)]
pub enum AuthRejection {
    /// No token in the header or query string.
    Missing,
    /// A token was presented but did not verify.
    Invalid(ProtocolError),
}

impl AuthRejection {
    /// Body of the 401 response.
    pub fn message(&self) -> &'static str {
        match self {
            AuthRejection::Missing => "Authentication required",
            AuthRejection::Invalid(_) => "Invalid token",
        }
    }

    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.message().to_string()));
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        response
    }
}

/// Pulls the bearer token out of an upgrade request.
pub fn extract_token(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());

    if let Some(token) = from_header {
        return Some(token.to_string());
    }

    request.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, value)| key == "token" && !value.is_empty())
            .map(|(_, value)| value.into_owned())
    })
}

/// Verifies the token carried by an upgrade request.
pub fn authorize(
    authority: &TokenAuthority,
    request: &Request,
) -> Result<TokenClaims, AuthRejection> {
    let token = extract_token(request).ok_or(AuthRejection::Missing)?;
    authority.verify(&token).map_err(AuthRejection::Invalid)
}

/// Websocket server fronting the relay hub.
pub struct RelayServer {
    listener: TcpListener,
    hub: RelayHub,
    router: CommandRouter,
    authority: Arc<TokenAuthority>,
}

impl RelayServer {
    /// Binds the listener.
    pub async fn bind(
        addr: SocketAddr,
        hub: RelayHub,
        router: CommandRouter,
        authority: Arc<TokenAuthority>,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;

        info!(addr = %addr, "Relay listener bound");

        Ok(Self {
            listener,
            hub,
            router,
            authority,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        self.hub.clone(),
                        self.router.clone(),
                        Arc::clone(&self.authority),
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "TCP accept failed");
                }
            }
        }

        info!("Relay listener stopped");
    }
}

type EventSink = SplitSink<WebSocketStream<TcpStream>, Message>;

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: RelayHub,
    router: CommandRouter,
    authority: Arc<TokenAuthority>,
    cancel: CancellationToken,
) {
    let check = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match authorize(&authority, request) {
            Ok(claims) => {
                debug!(remote = %peer, expires = claims.exp, "Observer authenticated");
                Ok(response)
            }
            Err(rejection) => {
                warn!(remote = %peer, reason = rejection.message(), "Rejected relay connection");
                Err(rejection.into_response())
            }
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, check).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(remote = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let (observer_id, events) = hub.register();
    info!(remote = %peer, observer_id, "Observer connected");

    if let Err(e) = serve_observer(ws, observer_id, events, &router, cancel).await {
        debug!(observer_id, error = %e, "Observer connection ended with error");
    }

    hub.unregister(observer_id);
    info!(remote = %peer, observer_id, "Observer disconnected");
}

async fn serve_observer(
    ws: WebSocketStream<TcpStream>,
    observer_id: ObserverId,
    mut events: tokio::sync::mpsc::Receiver<ServerEvent>,
    router: &CommandRouter,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            event = events.recv() => match event {
                Some(event) => send_event(&mut sink, &event).await?,
                None => {
                    // The hub dropped us: too slow, or shutting down.
                    debug!(observer_id, "Observer queue closed");
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = router.route_text(&text) {
                        warn!(observer_id, error = %e, "Rejected observer command");
                        send_event(&mut sink, &e.to_event()).await?;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    send_event(&mut sink, &ServerEvent::error("binary frames are not supported"))
                        .await?;
                }
                Some(Ok(Message::Ping(payload))) => {
                    sink.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}

async fn send_event(sink: &mut EventSink, event: &ServerEvent) -> Result<(), RelayError> {
    let json = event.to_json()?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http;

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut builder = http::Request::builder().uri(uri);
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_extract_token_from_header() {
        let req = request("/", Some("Bearer abc.def"));
        assert_eq!(extract_token(&req), Some("abc.def".to_string()));
    }

    #[test]
    fn test_extract_token_from_query() {
        let req = request("/?foo=1&token=abc%2Edef", None);
        assert_eq!(extract_token(&req), Some("abc.def".to_string()));
    }

    #[test]
    fn test_header_wins_over_query() {
        let req = request("/?token=query", Some("Bearer header"));
        assert_eq!(extract_token(&req), Some("header".to_string()));
    }

    #[test]
    fn test_extract_token_missing() {
        assert_eq!(extract_token(&request("/", None)), None);
        assert_eq!(extract_token(&request("/?token=", None)), None);
        assert_eq!(extract_token(&request("/", Some("Basic xyz"))), None);
        assert_eq!(extract_token(&request("/", Some("Bearer "))), None);
    }

    #[test]
    fn test_authorize() {
        let authority = TokenAuthority::new(b"relay test secret", 3600);
        let token = authority.issue().unwrap();

        let ok = request("/", Some(&format!("Bearer {}", token)));
        assert!(authorize(&authority, &ok).unwrap().authenticated);

        let missing = authorize(&authority, &request("/", None)).unwrap_err();
        assert_eq!(missing.message(), "Authentication required");

        let forged = authorize(&authority, &request("/?token=abc.def", None)).unwrap_err();
        assert_eq!(forged.message(), "Invalid token");

        let other = TokenAuthority::new(b"another secret", 3600);
        let foreign = request("/", Some(&format!("Bearer {}", other.issue().unwrap())));
        assert!(matches!(
            authorize(&authority, &foreign),
            Err(AuthRejection::Invalid(_))
        ));
    }

    #[test]
    fn test_rejection_response() {
        let response = AuthRejection::Missing.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.body().as_deref(), Some("Authentication required"));
    }
}
