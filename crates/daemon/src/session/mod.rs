//! Session management module.
//!
//! This module provides PTY-backed processes and the orchestrator that owns
//! them. Sessions can be created, written to, resized, destroyed and listed.

pub mod orchestrator;
pub mod pty;

pub use orchestrator::{default_title, SessionEvent, SessionOrchestrator, SHELL_TITLE};
pub use pty::{
    ManagedProcess, ProcessSink, ProcessSpec, SessionError, Utf8ChunkDecoder,
    SPAWN_FAILURE_EXIT_CODE,
};
