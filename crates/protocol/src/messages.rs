//! Relay message definitions for PaneHub.
//!
//! This module defines the commands observers send to the daemon and the
//! events the daemon broadcasts back. All messages travel as JSON text frames
//! with an adjacent `type`/`data` tag, payload fields in camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifier of a session as it appears on the wire.
pub type SessionId = String;

/// Public description of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Working directory the process was started in.
    pub cwd: String,
    /// Display title.
    pub title: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Commands sent by an observer to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    /// Start a new session. An empty `cwd` starts a plain shell.
    Create(CreateSession),
    /// Raw input for a session.
    Input(SessionInput),
    /// Terminal resize for a session.
    Resize(SessionResize),
    /// Terminate a session.
    Destroy(SessionId),
}

/// Payload of [`ClientCommand::Create`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSession {
    /// Working directory. Empty means a plain shell in the home directory.
    #[serde(default)]
    pub cwd: String,
    /// Optional display title overriding the derived one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Payload of [`ClientCommand::Input`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInput {
    /// Target session.
    pub terminal_id: SessionId,
    /// Raw input text.
    pub data: String,
}

/// Payload of [`ClientCommand::Resize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResize {
    /// Target session.
    pub terminal_id: SessionId,
    /// New width in columns.
    pub cols: u16,
    /// New height in rows.
    pub rows: u16,
}

/// Events broadcast by the daemon to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Full snapshot of live sessions, sent once per new connection.
    List(Vec<SessionInfo>),
    /// A session was created.
    Created(SessionInfo),
    /// A session was destroyed on request.
    Destroyed(SessionId),
    /// Output chunk from a session.
    Output(SessionOutput),
    /// A session's process exited. No further output follows for that id.
    Exited(SessionExited),
    /// A command from this connection could not be processed.
    Error(ErrorMessage),
}

/// Payload of [`ServerEvent::Output`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOutput {
    /// Source session.
    pub terminal_id: SessionId,
    /// Output text.
    pub data: String,
}

/// Payload of [`ServerEvent::Exited`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExited {
    /// Session that exited.
    pub terminal_id: SessionId,
    /// Exit code reported by the process, `-1` when it never started.
    pub exit_code: i32,
}

/// Payload of [`ServerEvent::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Human-readable description.
    pub message: String,
}

impl ClientCommand {
    /// Parses a command from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the command to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns the session this command targets, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientCommand::Create(_) => None,
            ClientCommand::Input(input) => Some(&input.terminal_id),
            ClientCommand::Resize(resize) => Some(&resize.terminal_id),
            ClientCommand::Destroy(id) => Some(id),
        }
    }
}

impl ServerEvent {
    /// Parses an event from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the event to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns the session this event concerns, if it concerns exactly one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerEvent::Created(info) => Some(&info.id),
            ServerEvent::Destroyed(id) => Some(id),
            ServerEvent::Output(output) => Some(&output.terminal_id),
            ServerEvent::Exited(exited) => Some(&exited.terminal_id),
            ServerEvent::List(_) | ServerEvent::Error(_) => None,
        }
    }

    /// Convenience constructor for an output event.
    pub fn output(terminal_id: impl Into<SessionId>, data: impl Into<String>) -> Self {
        ServerEvent::Output(SessionOutput {
            terminal_id: terminal_id.into(),
            data: data.into(),
        })
    }

    /// Convenience constructor for an exit event.
    pub fn exited(terminal_id: impl Into<SessionId>, exit_code: i32) -> Self {
        ServerEvent::Exited(SessionExited {
            terminal_id: terminal_id.into(),
            exit_code,
        })
    }

    /// Convenience constructor for an error event.
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorMessage {
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_info() -> SessionInfo {
        SessionInfo {
            id: "3f0c".to_string(),
            cwd: "/home/user/proj".to_string(),
            title: "proj".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_create_wire_shape() {
        let cmd = ClientCommand::from_json(
            r#"{"type":"create","data":{"cwd":"/srv/app","title":"api"}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Create(CreateSession {
                cwd: "/srv/app".to_string(),
                title: Some("api".to_string()),
            })
        );
    }

    #[test]
    fn test_create_without_title_or_cwd() {
        let cmd = ClientCommand::from_json(r#"{"type":"create","data":{}}"#).unwrap();
        assert_eq!(cmd, ClientCommand::Create(CreateSession::default()));

        let json = cmd.to_json().unwrap();
        assert!(!json.contains("title"));
    }

    #[test]
    fn test_input_uses_camel_case() {
        let cmd = ClientCommand::Input(SessionInput {
            terminal_id: "t1".to_string(),
            data: "ls\r".to_string(),
        });
        let json = cmd.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"input","data":{"terminalId":"t1","data":"ls\r"}}"#
        );
    }

    #[test]
    fn test_resize_parse() {
        let cmd = ClientCommand::from_json(
            r#"{"type":"resize","data":{"terminalId":"t1","cols":100,"rows":40}}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::Resize(resize) => {
                assert_eq!(resize.terminal_id, "t1");
                assert_eq!(resize.cols, 100);
                assert_eq!(resize.rows, 40);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_destroy_carries_bare_id() {
        let cmd = ClientCommand::from_json(r#"{"type":"destroy","data":"t9"}"#).unwrap();
        assert_eq!(cmd, ClientCommand::Destroy("t9".to_string()));
        assert_eq!(cmd.session_id(), Some("t9"));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(ClientCommand::from_json(r#"{"type":"reboot","data":null}"#).is_err());
        assert!(ClientCommand::from_json("not json").is_err());
    }

    #[test]
    fn test_session_info_wire_shape() {
        let value = serde_json::to_value(sample_info()).unwrap();
        assert_eq!(value["id"], "3f0c");
        assert_eq!(value["cwd"], "/home/user/proj");
        assert_eq!(value["title"], "proj");
        assert_eq!(value["createdAt"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn test_list_event() {
        let event = ServerEvent::List(vec![sample_info()]);
        let parsed = ServerEvent::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.session_id(), None);
    }

    #[test]
    fn test_exited_event_shape() {
        let json = ServerEvent::exited("t1", 130).to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"exited","data":{"terminalId":"t1","exitCode":130}}"#
        );
    }

    #[test]
    fn test_event_session_ids() {
        assert_eq!(ServerEvent::output("a", "x").session_id(), Some("a"));
        assert_eq!(ServerEvent::Destroyed("b".into()).session_id(), Some("b"));
        assert_eq!(ServerEvent::Created(sample_info()).session_id(), Some("3f0c"));
        assert_eq!(ServerEvent::error("bad").session_id(), None);
    }

    #[test]
    fn test_create_has_no_session_id() {
        let cmd = ClientCommand::Create(CreateSession::default());
        assert_eq!(cmd.session_id(), None);
    }
}
