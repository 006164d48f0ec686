//! Unix Domain Socket IPC between the CLI and a running daemon.
//!
//! The protocol is newline-delimited JSON: each request and each response is
//! a single JSON object followed by a newline.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/panehub/daemon.sock`
//! - Fallback: `/tmp/panehub-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{IpcClient, get_socket_path};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse};
pub use pidfile::{get_daemon_pid, get_pid_file_path, is_daemon_running};
pub use server::{IpcConnection, IpcError, IpcHandler, IpcServer};

use std::path::{Path, PathBuf};

/// Get the socket path for IPC communication.
pub fn get_socket_path() -> PathBuf {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from);
    socket_path_in(runtime_dir.as_deref(), nix::unistd::getuid().as_raw())
}

/// Resolves the socket path for a given runtime directory and user.
pub fn socket_path_in(runtime_dir: Option<&Path>, uid: u32) -> PathBuf {
    match runtime_dir {
        Some(dir) => dir.join("panehub").join("daemon.sock"),
        None => PathBuf::from(format!("/tmp/panehub-{}", uid)).join("daemon.sock"),
    }
}
