//! # PaneHub Daemon Library
//!
//! This crate runs interactive sessions on the host and relays them to any
//! number of authenticated websocket observers.
//!
//! ## Overview
//!
//! - **Session Orchestration**: spawn agent or shell processes on
//!   pseudo-terminals and expose them as addressable sessions
//! - **Relay**: a token-gated websocket server that broadcasts session events
//!   to every observer in per-session order
//! - **Local Control**: a Unix socket for the CLI (status, list, destroy, stop)
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Daemon Service                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐   events   ┌──────────────────────────┐  │
//! │  │    Session     │──────────▶│  Relay Hub (fan-out)     │  │
//! │  │  Orchestrator  │           └────────────┬─────────────┘  │
//! │  └───────▲────────┘                        │                │
//! │          │ commands                        ▼                │
//! │  ┌───────┴────────┐           ┌──────────────────────────┐  │
//! │  │ Command Router │◀──────────│  Relay Server (websocket)│  │
//! │  └────────────────┘           └──────────────────────────┘  │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │               IPC control socket (CLI)                 │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut service = DaemonService::new(config)?;
//!     service.start().await?;
//!
//!     service.shutdown_token().cancelled().await;
//!     service.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Managed processes and the session orchestrator
//! - [`router`]: Observer command dispatch
//! - [`relay`]: Websocket server and observer hub
//! - [`ipc`]: CLI control socket and PID file
//! - [`service`]: Daemon lifecycle

pub mod config;
pub mod ipc;
pub mod relay;
pub mod router;
pub mod service;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};
pub use relay::{RelayError, RelayHub, RelayServer};
pub use router::{CommandRouter, RouterError};
pub use service::{DaemonService, ServiceEvent, ServiceState};
pub use session::{SessionError, SessionEvent, SessionOrchestrator};
