use std::env;
use std::path::PathBuf;

use sandbox::protocol::{DEFAULT_HOST_ORIGIN, OPAQUE_ORIGIN};

use crate::error::HostError;

pub const HOST_ORIGIN_ENV: &str = sandbox::config::HOST_ORIGIN_ENV;
pub const SANDBOX_ORIGIN_ENV: &str = "HEDGEHOG_SANDBOX_ORIGIN";
pub const POOL_SIZE_ENV: &str = "HEDGEHOG_POOL_SIZE";
pub const WORKER_BIN_ENV: &str = "HEDGEHOG_WORKER_BIN";
pub const CONTAINER_IMAGE_ENV: &str = "HEDGEHOG_CONTAINER_IMAGE";
pub const CONTAINER_RUNTIME_ENV: &str = "HEDGEHOG_CONTAINER_RUNTIME";

pub const DEFAULT_POOL_SIZE: usize = 1;
const DEFAULT_CONTAINER_RUNTIME: &str = "runsc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// Run the worker binary directly as a child process.
    Process { worker_bin: Option<PathBuf> },
    /// Run the worker binary inside a container with no network.
    Container {
        image: String,
        runtime: String,
        worker_bin: Option<PathBuf>,
    },
}

impl Default for LaunchMode {
    fn default() -> Self {
        Self::Process { worker_bin: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Origin the host stamps on everything it posts.
    pub host_origin: String,
    /// The only origin inbound sandbox messages may carry.
    pub sandbox_origin: String,
    /// Number of loaded, unused sandboxes kept warm.
    pub pool_size: usize,
    pub launch: LaunchMode,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_origin: DEFAULT_HOST_ORIGIN.to_owned(),
            sandbox_origin: OPAQUE_ORIGIN.to_owned(),
            pool_size: DEFAULT_POOL_SIZE,
            launch: LaunchMode::default(),
        }
    }
}

impl HostConfig {
    /// Reads the configuration from the environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self, HostError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, HostError> {
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let pool_size = match value(POOL_SIZE_ENV) {
            Some(raw) => raw.parse::<usize>().map_err(|err| {
                HostError::Config(format!("{POOL_SIZE_ENV}={raw} is not a valid size: {err}"))
            })?,
            None => defaults.pool_size,
        };
        let worker_bin = value(WORKER_BIN_ENV).map(PathBuf::from);
        let launch = match value(CONTAINER_IMAGE_ENV) {
            Some(image) => LaunchMode::Container {
                image,
                runtime: value(CONTAINER_RUNTIME_ENV)
                    .unwrap_or_else(|| DEFAULT_CONTAINER_RUNTIME.to_owned()),
                worker_bin,
            },
            None => LaunchMode::Process { worker_bin },
        };

        Ok(Self {
            host_origin: value(HOST_ORIGIN_ENV).unwrap_or(defaults.host_origin),
            sandbox_origin: value(SANDBOX_ORIGIN_ENV).unwrap_or(defaults.sandbox_origin),
            pool_size,
            launch,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = HostConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.sandbox_origin, "null");
    }

    #[test]
    fn container_mode_when_image_is_set() {
        let config = HostConfig::from_lookup(lookup(&[
            (CONTAINER_IMAGE_ENV, "debian:stable-slim"),
            (WORKER_BIN_ENV, "/opt/hedgehog/sandbox_worker"),
            (HOST_ORIGIN_ENV, "https://ide.example"),
        ]))
        .unwrap();
        assert_eq!(config.host_origin, "https://ide.example");
        assert_eq!(
            config.launch,
            LaunchMode::Container {
                image: "debian:stable-slim".to_owned(),
                runtime: "runsc".to_owned(),
                worker_bin: Some(PathBuf::from("/opt/hedgehog/sandbox_worker")),
            }
        );
    }

    #[test]
    fn invalid_pool_size_is_rejected() {
        let err = HostConfig::from_lookup(lookup(&[(POOL_SIZE_ENV, "many")])).unwrap_err();
        assert!(matches!(err, HostError::Config(_)));
    }

    #[test]
    fn blank_values_fall_back() {
        let config = HostConfig::from_lookup(lookup(&[(POOL_SIZE_ENV, "  "), (HOST_ORIGIN_ENV, "")]))
            .unwrap();
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.host_origin, DEFAULT_HOST_ORIGIN);
    }
}
