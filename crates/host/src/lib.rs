//! Host side of the hedgehog sandbox protocol.
//!
//! The [`controller`] owns one execution sandbox at a time, loads a fresh one
//! for every run, and relays what the sandbox reports to an [`EventHandler`].
//! Sandboxes are reached through the [`SandboxLauncher`] / [`SandboxHandle`]
//! seam; [`launcher`] provides a process-backed and an in-process
//! implementation.
//!
//! [`EventHandler`]: controller::EventHandler

pub mod client;
pub mod config;
pub mod console;
pub mod controller;
pub mod error;
pub mod event;
pub mod launcher;
pub mod pool;
pub mod session;

use std::fmt;

use sandbox::protocol::CommandMessage;
use uuid::Uuid;

use crate::error::HostError;
use crate::event::MessagePort;

/// Identity of one sandbox instance. Plays the role of a frame's window
/// reference: every inbound message event is stamped with the id of the
/// sandbox it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SandboxId(Uuid);

impl SandboxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub trait SandboxHandle: Send {
    fn id(&self) -> SandboxId;
    /// Posts a message into the sandbox, stamped with the host origin.
    fn post_message(&mut self, message: CommandMessage) -> Result<(), HostError>;
    /// Discards the sandbox. Whatever it was running ends with it.
    fn terminate(&mut self);
}

pub trait SandboxLauncher: Send {
    /// Launches a fresh sandbox whose messages are delivered to `port`.
    fn launch(&self, port: MessagePort) -> Result<Box<dyn SandboxHandle>, HostError>;
}
