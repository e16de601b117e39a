use std::env;

use crate::protocol::{DEFAULT_HOST_ORIGIN, OPAQUE_ORIGIN};

pub const HOST_ORIGIN_ENV: &str = "HEDGEHOG_HOST_ORIGIN";

pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "json",
    "math",
    "random",
    "re",
    "itertools",
    "functools",
    "collections",
    "datetime",
    "decimal",
    "fractions",
    "statistics",
    "time",
    "string",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// The only origin whose messages the sandbox accepts. Fixed at launch.
    pub host_origin: String,
    /// Origin stamped on everything the sandbox posts.
    pub origin: String,
    pub allowed_modules: Vec<String>,
}

impl SandboxConfig {
    pub fn new(host_origin: impl Into<String>) -> Self {
        Self {
            host_origin: host_origin.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        match env::var(HOST_ORIGIN_ENV) {
            Ok(origin) if !origin.trim().is_empty() => Self::new(origin.trim()),
            _ => Self::default(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            host_origin: DEFAULT_HOST_ORIGIN.to_owned(),
            origin: OPAQUE_ORIGIN.to_owned(),
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|module| (*module).to_owned())
                .collect(),
        }
    }
}
