//! Inbound message events and the controller's mailbox.
//!
//! All sandboxes and the UI-facing handle share one ordered mailbox, so the
//! controller processes requests and sandbox messages on a single thread.
//! Only [`Requests`] keeps the mailbox open; sandboxes post through weak
//! [`MessagePort`]s, so the mailbox closes once the last requester is gone.

use sandbox::protocol::CommandMessage;
use tokio::sync::mpsc;

use crate::SandboxId;
use crate::controller::HostRequest;
use crate::error::HostError;

/// A message as delivered to the host: the data plus who sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub data: CommandMessage,
    /// Origin the sender declared.
    pub origin: String,
    /// Sandbox whose channel carried the message.
    pub source: SandboxId,
}

pub(crate) enum Mail {
    Event(MessageEvent),
    Request(HostRequest),
}

/// Delivers message events without keeping the mailbox open.
#[derive(Clone)]
pub struct MessagePort {
    sender: mpsc::WeakUnboundedSender<Mail>,
}

impl MessagePort {
    /// Delivers an event to the controller. Returns `false` once the controller is gone.
    pub fn post(&self, event: MessageEvent) -> bool {
        self.sender
            .upgrade()
            .is_some_and(|sender| sender.send(Mail::Event(event)).is_ok())
    }
}

/// The owning side of the mailbox.
#[derive(Clone)]
pub struct Requests {
    sender: mpsc::UnboundedSender<Mail>,
}

impl Requests {
    pub fn port(&self) -> MessagePort {
        MessagePort {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) fn send(&self, request: HostRequest) -> Result<(), HostError> {
        self.sender
            .send(Mail::Request(request))
            .map_err(|_| HostError::Unavailable)
    }
}

pub struct Mailbox {
    receiver: mpsc::UnboundedReceiver<Mail>,
}

impl Mailbox {
    pub(crate) fn blocking_recv(&mut self) -> Option<Mail> {
        self.receiver.blocking_recv()
    }

    /// Takes the next queued message event without blocking, skipping requests.
    pub fn try_next_event(&mut self) -> Option<MessageEvent> {
        while let Ok(mail) = self.receiver.try_recv() {
            if let Mail::Event(event) = mail {
                return Some(event);
            }
        }
        None
    }
}

pub fn channel() -> (Requests, Mailbox) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Requests { sender }, Mailbox { receiver })
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn ready(source: SandboxId) -> MessageEvent {
        MessageEvent {
            data: CommandMessage::new("ready", Value::Null),
            origin: "null".to_owned(),
            source,
        }
    }

    #[test]
    fn ports_do_not_keep_the_mailbox_open() {
        let (requests, mut mailbox) = channel();
        let port = requests.port();
        let source = SandboxId::new();

        assert!(port.post(ready(source)));
        assert_eq!(mailbox.try_next_event().map(|event| event.source), Some(source));

        drop(requests);
        assert!(!port.post(ready(source)));
        assert!(mailbox.blocking_recv().is_none());
    }
}
