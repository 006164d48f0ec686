//! Command router for dispatching observer commands to the orchestrator.
//!
//! This module provides the `CommandRouter` struct that turns relay frames
//! into [`SessionOrchestrator`] calls. Commands for unknown sessions are
//! absorbed silently; the resulting broadcasts come from the orchestrator's
//! own event stream, never from the router.

use protocol::messages::{CreateSession, SessionInput, SessionResize};
use protocol::{ClientCommand, ServerEvent};
use tracing::{debug, warn};

use crate::session::SessionOrchestrator;

/// Errors that can occur during command routing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    /// The frame is not a valid command.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The command is well formed but its arguments are not acceptable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RouterError {
    /// Converts the error into the event sent back to the offending observer.
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::error(self.to_string())
    }
}

/// Maps relay commands one-to-one onto orchestrator operations.
#[derive(Debug, Clone)]
pub struct CommandRouter {
    orchestrator: SessionOrchestrator,
}

impl CommandRouter {
    /// Creates a router over the given orchestrator.
    pub fn new(orchestrator: SessionOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Returns the orchestrator commands are routed to.
    pub fn orchestrator(&self) -> &SessionOrchestrator {
        &self.orchestrator
    }

    /// Parses and routes a text frame.
    pub fn route_text(&self, text: &str) -> Result<(), RouterError> {
        let command = ClientCommand::from_json(text)
            .map_err(|e| RouterError::InvalidCommand(e.to_string()))?;
        self.route(command)
    }

    /// Routes a parsed command.
    pub fn route(&self, command: ClientCommand) -> Result<(), RouterError> {
        match command {
            ClientCommand::Create(CreateSession { cwd, title }) => {
                let info = self.orchestrator.create_session(&cwd, title.as_deref());
                debug!(session_id = %info.id, "Routed create");
            }
            ClientCommand::Input(SessionInput { terminal_id, data }) => {
                if !self.orchestrator.write(&terminal_id, data.as_bytes()) {
                    debug!(session_id = %terminal_id, "Input for unknown session ignored");
                }
            }
            ClientCommand::Resize(SessionResize {
                terminal_id,
                cols,
                rows,
            }) => {
                if !self.orchestrator.contains(&terminal_id) {
                    debug!(session_id = %terminal_id, "Resize for unknown session ignored");
                    return Ok(());
                }
                if cols == 0 || rows == 0 {
                    warn!(session_id = %terminal_id, cols, rows, "Rejected zero-sized resize");
                    return Err(RouterError::InvalidRequest(format!(
                        "terminal size must be non-zero, got {}x{}",
                        cols, rows
                    )));
                }
                if !self.orchestrator.resize(&terminal_id, cols, rows) {
                    debug!(session_id = %terminal_id, "Resize for unknown session ignored");
                }
            }
            ClientCommand::Destroy(terminal_id) => {
                if !self.orchestrator.destroy_session(&terminal_id) {
                    debug!(session_id = %terminal_id, "Destroy for unknown session ignored");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::SessionEvent;
    use tempfile::TempDir;

    fn router(home: &TempDir) -> CommandRouter {
        let config = SessionConfig {
            shell: "/bin/sh".to_string(),
            agent_command: "/bin/sh".to_string(),
            ..SessionConfig::default()
        };
        CommandRouter::new(SessionOrchestrator::with_home_dir(config, home.path()))
    }

    #[test]
    fn test_invalid_frame_is_reported() {
        let home = TempDir::new().unwrap();
        let router = router(&home);

        let err = router.route_text("{\"type\":\"explode\"}").unwrap_err();
        assert!(matches!(err, RouterError::InvalidCommand(_)));

        match err.to_event() {
            ServerEvent::Error(message) => assert!(message.message.starts_with("invalid command")),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_session_commands_are_absorbed() {
        let home = TempDir::new().unwrap();
        let router = router(&home);
        let (_, mut rx) = router.orchestrator().subscribe();

        let frames = [
            r#"{"type":"input","data":{"terminalId":"ghost","data":"ls\n"}}"#,
            r#"{"type":"resize","data":{"terminalId":"ghost","cols":80,"rows":24}}"#,
            r#"{"type":"destroy","data":"ghost"}"#,
        ];
        for frame in frames {
            assert_eq!(router.route_text(frame), Ok(()));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_zero_resize_rejected_for_live_session() {
        let home = TempDir::new().unwrap();
        let router = router(&home);
        let info = router.orchestrator().create_session("", None);

        let result = router.route(ClientCommand::Resize(SessionResize {
            terminal_id: info.id,
            cols: 0,
            rows: 24,
        }));
        assert!(matches!(result, Err(RouterError::InvalidRequest(_))));
        router.orchestrator().shutdown();
    }

    #[test]
    fn test_zero_resize_for_unknown_session_is_absorbed() {
        let home = TempDir::new().unwrap();
        let router = router(&home);
        let (_, mut rx) = router.orchestrator().subscribe();

        let result = router.route_text(r#"{"type":"resize","data":{"terminalId":"ghost","cols":0,"rows":0}}"#);
        assert_eq!(result, Ok(()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_create_and_destroy_route_to_orchestrator() {
        let home = TempDir::new().unwrap();
        let router = router(&home);
        let (_, mut rx) = router.orchestrator().subscribe();

        router
            .route_text(r#"{"type":"create","data":{"cwd":"","title":"main"}}"#)
            .unwrap();

        let created = match rx.recv().await {
            Some(SessionEvent::Created(info)) => info,
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(created.title, "main");
        assert_eq!(router.orchestrator().list(), vec![created.clone()]);

        router
            .route(ClientCommand::Destroy(created.id.clone()))
            .unwrap();
        assert!(router.orchestrator().list().is_empty());

        loop {
            match rx.recv().await {
                Some(SessionEvent::Destroyed(id)) => {
                    assert_eq!(id, created.id);
                    break;
                }
                Some(_) => continue,
                None => panic!("stream ended before destroy"),
            }
        }
    }
}
