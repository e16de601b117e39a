use sandbox::protocol::ProtocolError;
use thiserror::Error;

use crate::SandboxId;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to launch sandbox: {0}")]
    Launch(String),
    #[error("failed to post to sandbox {id}: {message}")]
    Post { id: SandboxId, message: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("host controller unavailable")]
    Unavailable,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
