//! IPC client used by the CLI to talk to a running daemon.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

fn timed_out(what: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, what.to_string()))
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// Fails when no daemon is listening.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to the daemon, bounding both the connect and later requests
    /// by `timeout`.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request to the daemon and wait for its response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.round_trip(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn round_trip(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Returns `true` if the daemon answers with a Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Get the current status of the daemon.
    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    /// Request the daemon to stop.
    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    /// List all live sessions.
    pub async fn list_sessions(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::ListSessions).await
    }

    /// Destroy a session by ID.
    pub async fn destroy_session(&mut self, session_id: String) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::DestroySession { session_id }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::ipc::server::{IpcHandler, IpcServer};
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    /// Knows a single session, "s1".
    struct OneSession;

    impl IpcHandler for OneSession {
        fn handle(&self, request: IpcRequest) -> IpcResponse {
            match request {
                IpcRequest::Ping => IpcResponse::Pong,
                IpcRequest::Status => IpcResponse::Status {
                    running: true,
                    uptime_secs: 42,
                    session_count: 1,
                    observer_count: 3,
                    bind_addr: "127.0.0.1:3000".to_string(),
                },
                IpcRequest::Stop => IpcResponse::Stopping,
                IpcRequest::ListSessions => IpcResponse::Sessions {
                    sessions: Vec::new(),
                },
                IpcRequest::DestroySession { session_id } if session_id == "s1" => {
                    IpcResponse::SessionDestroyed { session_id }
                }
                IpcRequest::DestroySession { session_id } => IpcResponse::Error {
                    message: format!("session not found: {}", session_id),
                },
            }
        }
    }

    #[tokio::test]
    async fn test_connect_fails_when_daemon_not_running() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nonexistent.sock");

        assert!(IpcClient::connect(&socket_path).await.is_err());
    }

    #[tokio::test]
    async fn test_requests_over_one_connection() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();
        let cancel = CancellationToken::new();
        let serving = tokio::spawn(server.serve(Arc::new(OneSession), cancel.clone()));

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert!(client.ping().await.unwrap());
        assert!(matches!(
            client.status().await.unwrap(),
            IpcResponse::Status { observer_count: 3, .. }
        ));
        assert_eq!(
            client.destroy_session("s1".to_string()).await.unwrap(),
            IpcResponse::SessionDestroyed {
                session_id: "s1".to_string()
            }
        );
        assert!(matches!(
            client.destroy_session("s9".to_string()).await.unwrap(),
            IpcResponse::Error { .. }
        ));
        assert_eq!(client.stop().await.unwrap(), IpcResponse::Stopping);

        cancel.cancel();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_connection_is_eof() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let _ = conn.read_request().await;
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        match client.list_sessions().await {
            Err(IpcError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("Expected EOF, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let _held = tokio::spawn(async move {
            let _conn = server.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        client.set_timeout(Duration::from_millis(100));
        match client.ping().await {
            Err(IpcError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("Expected timeout, got {:?}", other),
        }
    }
}
