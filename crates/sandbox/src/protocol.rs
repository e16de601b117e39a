//! Message schema shared by the host and the sandbox.
//!
//! Every message is a `{command, payload}` pair. On a pipe it travels inside a
//! [`WireEnvelope`] that also names the sender's origin and the origin it is
//! addressed to. Decoding is two-step: the envelope is read generically, then
//! the receiving side maps the command onto its closed set of variants and
//! ignores commands it does not know.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Origin of a sandbox that was not granted same-origin rights.
pub const OPAQUE_ORIGIN: &str = "null";

/// Target origin that matches every receiver.
pub const WILDCARD_TARGET: &str = "*";

/// Host origin used when nothing is configured.
pub const DEFAULT_HOST_ORIGIN: &str = "http://localhost:3000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

impl CommandMessage {
    pub fn new(command: impl Into<String>, payload: Value) -> Self {
        Self {
            command: command.into(),
            payload,
        }
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| {
            ProtocolError::InvalidPayload {
                command: self.command.clone(),
                source,
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub origin: String,
    pub target_origin: String,
    pub data: CommandMessage,
}

impl WireEnvelope {
    pub fn new(origin: impl Into<String>, data: CommandMessage) -> Self {
        Self {
            origin: origin.into(),
            target_origin: WILDCARD_TARGET.to_owned(),
            data,
        }
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim_end()).map_err(ProtocolError::Decode)
    }
}

/// Whether a message addressed to `target` may be delivered to a receiver at `origin`.
pub fn target_matches(target: &str, origin: &str) -> bool {
    target == WILDCARD_TARGET || target == origin
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("invalid payload for `{command}`: {source}")]
    InvalidPayload {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    Stdin,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Stdin => "stdin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPayload {
    pub text: String,
    pub stream: OutputStream,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExitPayload {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub event: String,
}

/// A named event pushed to a program that subscribed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

/// Commands the host sends into a sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    Execute(String),
    Reply(Value),
    ErrorReply(String),
    Event(EventPayload),
}

impl HostCommand {
    pub const EXECUTE: &'static str = "execute";
    pub const REPLY: &'static str = "reply";
    pub const ERROR_REPLY: &'static str = "error_reply";
    pub const EVENT: &'static str = "event";

    /// Maps a generic message onto a host command. Unknown commands yield `Ok(None)`.
    pub fn from_message(message: &CommandMessage) -> Result<Option<Self>, ProtocolError> {
        let command = match message.command.as_str() {
            Self::EXECUTE => Self::Execute(message.decode()?),
            Self::REPLY => Self::Reply(message.payload.clone()),
            Self::ERROR_REPLY => Self::ErrorReply(error_text(&message.payload)),
            Self::EVENT => Self::Event(message.decode()?),
            _ => return Ok(None),
        };
        Ok(Some(command))
    }

    pub fn into_message(self) -> CommandMessage {
        match self {
            Self::Execute(code) => CommandMessage::new(Self::EXECUTE, Value::String(code)),
            Self::Reply(value) => CommandMessage::new(Self::REPLY, value),
            Self::ErrorReply(error) => CommandMessage::new(Self::ERROR_REPLY, Value::String(error)),
            Self::Event(event) => {
                let EventPayload { event, payload } = event;
                CommandMessage::new(Self::EVENT, json!({ "event": event, "payload": payload }))
            }
        }
    }
}

/// Events a sandbox reports back to its host.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxEvent {
    Ready,
    Output(OutputPayload),
    Exit(ExitPayload),
    Call(CallPayload),
    Subscribe(SubscribePayload),
}

impl SandboxEvent {
    pub const READY: &'static str = "ready";
    pub const OUTPUT: &'static str = "output";
    pub const EXIT: &'static str = "exit";
    pub const CALL: &'static str = "call";
    pub const SUBSCRIBE: &'static str = "subscribe";

    /// Maps a generic message onto a sandbox event. Unknown commands yield `Ok(None)`.
    pub fn from_message(message: &CommandMessage) -> Result<Option<Self>, ProtocolError> {
        let event = match message.command.as_str() {
            Self::READY => Self::Ready,
            Self::OUTPUT => Self::Output(message.decode()?),
            Self::EXIT => Self::Exit(exit_payload(message)),
            Self::CALL => Self::Call(message.decode()?),
            Self::SUBSCRIBE => Self::Subscribe(message.decode()?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn into_message(self) -> Result<CommandMessage, ProtocolError> {
        let (command, payload) = match self {
            Self::Ready => (Self::READY, Value::Null),
            Self::Output(output) => (Self::OUTPUT, to_value(output)?),
            Self::Exit(exit) => (Self::EXIT, to_value(exit)?),
            Self::Call(call) => (Self::CALL, to_value(call)?),
            Self::Subscribe(subscription) => (Self::SUBSCRIBE, to_value(subscription)?),
        };
        Ok(CommandMessage::new(command, payload))
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(ProtocolError::Encode)
}

/// Every `exit` is terminal. Payloads that are not an `ExitPayload` become its error text.
fn exit_payload(message: &CommandMessage) -> ExitPayload {
    match &message.payload {
        Value::Null => ExitPayload::default(),
        Value::Object(_) => message.decode().unwrap_or_else(|_| ExitPayload {
            error: Some(error_text(&message.payload)),
        }),
        other => ExitPayload {
            error: Some(error_text(other)),
        },
    }
}

fn error_text(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        Value::Null => "unknown error".to_owned(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_commands_are_ignored() {
        let message = CommandMessage::new("telemetry", json!({"speed": 3}));
        assert!(SandboxEvent::from_message(&message).unwrap().is_none());
        assert!(HostCommand::from_message(&message).unwrap().is_none());
    }

    #[test]
    fn exit_without_payload_is_success() {
        let envelope = WireEnvelope::from_line(r#"{"origin":"null","target_origin":"*","data":{"command":"exit"}}"#)
            .unwrap();
        assert_eq!(envelope.data.payload, Value::Null);
        let event = SandboxEvent::from_message(&envelope.data).unwrap();
        assert_eq!(event, Some(SandboxEvent::Exit(ExitPayload::default())));
    }

    #[test]
    fn exit_carries_error_metadata() {
        let message = CommandMessage::new("exit", json!({"error": "ValueError: boom"}));
        match SandboxEvent::from_message(&message).unwrap() {
            Some(SandboxEvent::Exit(exit)) => {
                assert!(!exit.is_success());
                assert_eq!(exit.error.as_deref(), Some("ValueError: boom"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn any_exit_payload_is_terminal() {
        let exit = |payload: Value| match SandboxEvent::from_message(&CommandMessage::new("exit", payload)) {
            Ok(Some(SandboxEvent::Exit(exit))) => exit,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(exit(json!("Error: boom")).error.as_deref(), Some("Error: boom"));
        assert_eq!(exit(json!(3)).error.as_deref(), Some("3"));
        assert_eq!(exit(json!({"error": 5})).error.as_deref(), Some(r#"{"error":5}"#));
        assert!(exit(json!({})).is_success());
    }

    #[test]
    fn malformed_output_payload_is_rejected() {
        let message = CommandMessage::new("output", json!({"text": 3}));
        let err = SandboxEvent::from_message(&message).unwrap_err();
        assert!(err.to_string().contains("output"));
    }

    #[test]
    fn output_stream_uses_lowercase_tags() {
        let message = SandboxEvent::Output(OutputPayload {
            text: "hi\n".to_owned(),
            stream: OutputStream::Stderr,
        })
        .into_message()
        .unwrap();
        assert_eq!(message.payload, json!({"text": "hi\n", "stream": "stderr"}));
    }

    #[test]
    fn execute_requires_source_text() {
        let message = CommandMessage::new("execute", json!({"code": "print(1)"}));
        assert!(HostCommand::from_message(&message).is_err());

        let message = HostCommand::Execute("print(1)".to_owned()).into_message();
        assert_eq!(
            HostCommand::from_message(&message).unwrap(),
            Some(HostCommand::Execute("print(1)".to_owned()))
        );
    }

    #[test]
    fn error_reply_accepts_non_string_errors() {
        let message = CommandMessage::new("error_reply", json!({"code": 7}));
        assert_eq!(
            HostCommand::from_message(&message).unwrap(),
            Some(HostCommand::ErrorReply(r#"{"code":7}"#.to_owned()))
        );
    }

    #[test]
    fn subscribe_and_event_decode_on_their_own_side() {
        let subscribe = CommandMessage::new("subscribe", json!({"event": "collision_robot"}));
        assert_eq!(
            SandboxEvent::from_message(&subscribe).unwrap(),
            Some(SandboxEvent::Subscribe(SubscribePayload {
                event: "collision_robot".to_owned(),
            }))
        );
        assert!(HostCommand::from_message(&subscribe).unwrap().is_none());

        let event = HostCommand::Event(EventPayload {
            event: "collision".to_owned(),
            payload: json!({"bodyA": "robot", "bodyB": "wall"}),
        })
        .into_message();
        assert_eq!(event.command, "event");
        assert_eq!(event.payload["event"], "collision");
        assert!(SandboxEvent::from_message(&event).unwrap().is_none());

        let nameless = CommandMessage::new("event", json!({"payload": 1}));
        assert!(HostCommand::from_message(&nameless).is_err());
    }

    #[test]
    fn wildcard_target_matches_any_origin() {
        assert!(target_matches("*", "https://ide.example"));
        assert!(target_matches("null", "null"));
        assert!(!target_matches("https://other.example", "https://ide.example"));
    }
}
