use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;

use sandbox::protocol::{CommandMessage, WireEnvelope, target_matches};
use tracing::{debug, warn};

use crate::error::HostError;
use crate::event::{MessageEvent, MessagePort};
use crate::{SandboxHandle, SandboxId};

/// A sandbox running as a child process that speaks JSON lines on stdin/stdout.
pub struct SandboxClient {
    id: SandboxId,
    host_origin: String,
    child: Child,
    stdin: BufWriter<ChildStdin>,
    /// Extra teardown for sandboxes that outlive their client process.
    cleanup: Option<Command>,
    terminated: bool,
}

impl SandboxClient {
    /// Wraps a spawned worker and starts forwarding its stdout to `port`.
    pub fn new(
        id: SandboxId,
        host_origin: impl Into<String>,
        mut child: Child,
        port: MessagePort,
    ) -> Result<Self, HostError> {
        let host_origin = host_origin.into();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::Launch("sandbox worker missing stdin".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::Launch("sandbox worker missing stdout".to_owned()))?;

        let reader_origin = host_origin.clone();
        let spawned = thread::Builder::new()
            .name(format!("sandbox-{id}"))
            .spawn(move || {
                let delivered = forward_lines(id, &reader_origin, BufReader::new(stdout), &port);
                debug!(sandbox = %id, delivered, "sandbox output closed");
            });
        if let Err(err) = spawned {
            let _ = child.kill();
            let _ = child.wait();
            return Err(HostError::Launch(format!("failed to spawn sandbox reader: {err}")));
        }

        Ok(Self {
            id,
            host_origin,
            child,
            stdin: BufWriter::new(stdin),
            cleanup: None,
            terminated: false,
        })
    }

    pub fn with_cleanup(mut self, cleanup: Command) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    fn write_line(&mut self, line: &str) -> Result<(), String> {
        self.stdin
            .write_all(line.as_bytes())
            .map_err(|err| format!("sandbox worker write failed: {err}"))?;
        self.stdin
            .write_all(b"\n")
            .map_err(|err| format!("sandbox worker write failed: {err}"))?;
        self.stdin
            .flush()
            .map_err(|err| format!("sandbox worker flush failed: {err}"))
    }
}

impl SandboxHandle for SandboxClient {
    fn id(&self) -> SandboxId {
        self.id
    }

    fn post_message(&mut self, message: CommandMessage) -> Result<(), HostError> {
        if self.terminated {
            return Err(HostError::Post {
                id: self.id,
                message: "sandbox terminated".to_owned(),
            });
        }
        let line = WireEnvelope::new(self.host_origin.clone(), message).to_line()?;
        self.write_line(&line).map_err(|message| HostError::Post {
            id: self.id,
            message,
        })
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        if let Some(mut cleanup) = self.cleanup.take() {
            let status = cleanup
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if let Err(err) = status {
                warn!(sandbox = %self.id, error = %err, "sandbox cleanup failed");
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
        debug!(sandbox = %self.id, "sandbox terminated");
    }
}

impl Drop for SandboxClient {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Turns worker output lines into message events stamped with `source`.
/// Lines that do not decode, or that are addressed to another origin, are
/// dropped. Returns the number of events delivered.
pub fn forward_lines(
    source: SandboxId,
    host_origin: &str,
    reader: impl BufRead,
    port: &MessagePort,
) -> usize {
    let mut delivered = 0;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                debug!(sandbox = %source, error = %err, "sandbox read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let envelope = match WireEnvelope::from_line(&line) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(sandbox = %source, error = %err, "dropping undecodable line");
                continue;
            }
        };
        if !target_matches(&envelope.target_origin, host_origin) {
            continue;
        }
        let event = MessageEvent {
            data: envelope.data,
            origin: envelope.origin,
            source,
        };
        if !port.post(event) {
            break;
        }
        delivered += 1;
    }
    delivered
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use sandbox::protocol::{SandboxEvent, WILDCARD_TARGET};
    use serde_json::json;

    use super::*;
    use crate::event;

    fn line(origin: &str, target: &str, message: CommandMessage) -> String {
        let mut envelope = WireEnvelope::new(origin, message);
        envelope.target_origin = target.to_owned();
        envelope.to_line().unwrap()
    }

    #[test]
    fn forwards_lines_stamped_with_source() {
        let (requests, mut mailbox) = event::channel();
        let port = requests.port();
        let source = SandboxId::new();
        let ready = SandboxEvent::Ready.into_message().unwrap();
        let output = CommandMessage::new("output", json!({"text": "hi\n", "stream": "stdout"}));
        let input = [
            line("null", WILDCARD_TARGET, ready.clone()),
            "not json".to_owned(),
            String::new(),
            line("null", "https://elsewhere.example", output.clone()),
            line("null", "http://localhost:3000", output.clone()),
        ]
        .join("\n");

        let delivered = forward_lines(source, "http://localhost:3000", Cursor::new(input), &port);
        assert_eq!(delivered, 2);

        let first = mailbox.try_next_event().unwrap();
        assert_eq!(first.source, source);
        assert_eq!(first.origin, "null");
        assert_eq!(first.data, ready);
        assert_eq!(mailbox.try_next_event().unwrap().data, output);
        assert!(mailbox.try_next_event().is_none());
    }

    #[test]
    fn declared_origin_is_passed_through_unchanged() {
        let (requests, mut mailbox) = event::channel();
        let port = requests.port();
        let input = line(
            "https://evil.example",
            WILDCARD_TARGET,
            CommandMessage::new("exit", serde_json::Value::Null),
        );
        forward_lines(SandboxId::new(), "http://localhost:3000", Cursor::new(input), &port);
        assert_eq!(mailbox.try_next_event().unwrap().origin, "https://evil.example");
    }

    #[test]
    fn stops_when_the_controller_is_gone() {
        let (requests, mailbox) = event::channel();
        let port = requests.port();
        drop(mailbox);
        let input = line("null", WILDCARD_TARGET, SandboxEvent::Ready.into_message().unwrap());
        assert_eq!(forward_lines(SandboxId::new(), "x", Cursor::new(input), &port), 0);
    }
}
