//! IPC message types for CLI-daemon communication.
//!
//! This module defines the request and response types exchanged over the
//! daemon's Unix Domain Socket.

use protocol::SessionInfo;
use serde::{Deserialize, Serialize};

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List all live sessions.
    ListSessions,
    /// Terminate a session by ID.
    DestroySession {
        /// The session to terminate.
        session_id: String,
    },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of live sessions.
        session_count: usize,
        /// Number of connected relay observers.
        observer_count: usize,
        /// Address the relay is listening on.
        bind_addr: String,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// Live sessions in creation order.
    Sessions {
        /// Information about each session.
        sessions: Vec<SessionInfo>,
    },
    /// Confirmation that a session was destroyed.
    SessionDestroyed {
        /// The ID of the destroyed session.
        session_id: String,
    },
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}
