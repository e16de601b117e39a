use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("python init error: {0}")]
    Init(String),
    #[error("python exec error: {0}")]
    Exec(String),
    #[error("failed to post message: {0}")]
    Post(String),
    #[error("host connection closed")]
    Disconnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
