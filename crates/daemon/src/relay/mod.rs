//! Transport relay.
//!
//! Binds the session orchestrator to websocket observers:
//!
//! - [`hub`]: ordered fan-out of orchestrator events with bounded queues
//! - [`server`]: token-gated websocket listener and per-connection loop

pub mod hub;
pub mod server;

pub use hub::{ObserverId, ObserverStats, RelayHub};
pub use server::{authorize, extract_token, AuthRejection, RelayError, RelayServer};
