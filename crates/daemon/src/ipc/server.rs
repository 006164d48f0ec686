//! IPC server for handling CLI connections via Unix Domain Sockets.
//!
//! The server accepts CLI connections and answers newline-delimited JSON
//! requests through an [`IpcHandler`]. The socket file is removed when the
//! server is dropped.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::messages::{IpcRequest, IpcResponse};

/// Answers control requests on behalf of the running daemon.
pub trait IpcHandler: Send + Sync + 'static {
    /// Produces the response for one request.
    fn handle(&self, request: IpcRequest) -> IpcResponse;
}

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Parent directories are created with mode 0700. A leftover socket file
    /// at the same path is replaced.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                create_private_dir(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        tracing::debug!(path = %path.display(), "IPC socket bound");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Path of the bound socket.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }

    /// Serves connections until `cancel` fires.
    ///
    /// Each connection runs on its own task and may send any number of
    /// requests.
    pub async fn serve(self, handler: Arc<dyn IpcHandler>, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.accept() => accepted,
            };

            match accepted {
                Ok(conn) => {
                    tokio::spawn(serve_connection(conn, Arc::clone(&handler)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "IPC accept failed");
                }
            }
        }
        tracing::debug!("IPC server stopped");
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn serve_connection(mut conn: IpcConnection, handler: Arc<dyn IpcHandler>) {
    loop {
        let response = match conn.read_request().await {
            Ok(Some(request)) => {
                tracing::debug!(request = ?request, "IPC request");
                handler.handle(request)
            }
            Ok(None) => break,
            Err(IpcError::Json(e)) => IpcResponse::Error {
                message: format!("malformed request: {}", e),
            },
            Err(e) => {
                tracing::debug!(error = %e, "IPC connection error");
                break;
            }
        };

        if let Err(e) = conn.send_response(&response).await {
            tracing::debug!(error = %e, "Failed to send IPC response");
            break;
        }
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
}

/// A connection to an IPC client.
///
/// Wraps a Unix stream speaking the newline-delimited JSON protocol.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(line.trim())?))
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
