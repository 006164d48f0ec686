//! # PaneHub Client Library
//!
//! Observer-side building blocks for PaneHub front ends.
//!
//! ## Overview
//!
//! - **Relay Connection**: authenticated websocket client with reconnect
//! - **Session Directory**: the locally cached session list, focus, and
//!   per-session output routing, driven by relay events
//! - **Layout Engine**: rows of resizable cells with drag-and-drop moves
//!
//! ## Example Usage
//!
//! ```rust
//! use client::SessionDirectory;
//! use client::layout::DropTarget;
//! use protocol::{ServerEvent, SessionInfo};
//!
//! let session = |id: &str| SessionInfo {
//!     id: id.to_string(),
//!     cwd: String::new(),
//!     title: id.to_string(),
//!     created_at: chrono::Utc::now(),
//! };
//!
//! let mut directory = SessionDirectory::new();
//! directory.apply(ServerEvent::List(vec![session("a"), session("b")]));
//!
//! let row = directory.layout().unwrap().rows()[0].id();
//! let engine = directory.layout_engine_mut();
//! engine.start_drag("b");
//! engine.set_drop_target(Some(DropTarget::NewRowBelow { row }));
//! assert!(engine.end_drag());
//! assert_eq!(directory.layout().unwrap().rows().len(), 2);
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: Relay websocket client
//! - [`directory`]: Session list and output routing
//! - [`layout`]: Grid layout engine

pub mod connection;
pub mod directory;
pub mod layout;

pub use protocol;

pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionState, RelayConnection,
};
pub use directory::{OutputSink, SessionDirectory};
pub use layout::{
    Cell, DragState, DropTarget, GridLayout, LayoutEngine, LayoutError, Row, RowId, Share,
};
