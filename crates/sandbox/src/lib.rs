//! Execution side of the hedgehog sandbox protocol.
//!
//! A sandbox instance evaluates exactly one program and reports back to its
//! host through `{command, payload}` messages. [`worker`] drives the lifecycle,
//! [`runtime`] owns the interpreter, and [`protocol`] is the schema both sides
//! share.

pub mod config;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod worker;

pub use config::SandboxConfig;
pub use error::SandboxError;
