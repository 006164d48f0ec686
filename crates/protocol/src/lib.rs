//! # PaneHub Protocol Library
//!
//! This crate provides the wire vocabulary shared by the PaneHub daemon and
//! its clients, plus the credential primitives that gate relay access.
//!
//! ## Overview
//!
//! - **Messages**: [`ClientCommand`] (observer → daemon) and [`ServerEvent`]
//!   (daemon → every observer), carried as JSON text frames
//! - **Auth**: password verification and signed, expiring bearer tokens
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientCommand, ServerEvent, TokenAuthority};
//! use protocol::messages::CreateSession;
//!
//! let authority = TokenAuthority::new(b"server secret", 3600);
//! let token = authority.issue().unwrap();
//! assert!(authority.verify(&token).is_ok());
//!
//! let command = ClientCommand::Create(CreateSession {
//!     cwd: "/home/user/proj".to_string(),
//!     title: None,
//! });
//! let frame = command.to_json().unwrap();
//! assert_eq!(ClientCommand::from_json(&frame).unwrap(), command);
//!
//! let event = ServerEvent::output("some-id", "hello\r\n");
//! assert_eq!(event.session_id(), Some("some-id"));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Relay command and event definitions
//! - [`auth`]: Password hashes and access tokens
//! - [`error`]: Error types

pub mod auth;
pub mod error;
pub mod messages;

pub use auth::{
    generate_secret, CredentialVerifier, PasswordHash, TokenAuthority, TokenClaims,
    DEFAULT_TOKEN_TTL_SECS, SECRET_LENGTH,
};
pub use error::{ProtocolError, Result};
pub use messages::{ClientCommand, ServerEvent, SessionId, SessionInfo};
