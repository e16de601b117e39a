use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use sandbox::config::HOST_ORIGIN_ENV;
use sandbox::protocol::{CommandMessage, WireEnvelope};
use sandbox::worker::{Outbox, Worker};
use sandbox::{SandboxConfig, SandboxError};
use tracing::{debug, warn};

use crate::client::SandboxClient;
use crate::config::{HostConfig, LaunchMode};
use crate::error::HostError;
use crate::event::{MessageEvent, MessagePort};
use crate::{SandboxHandle, SandboxId, SandboxLauncher};

const WORKER_BIN_NAME: &str = "sandbox_worker";
const CONTAINER_WORKER_PATH: &str = "/sandbox_worker";
const WORKER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub fn build_launcher(config: &HostConfig) -> Box<dyn SandboxLauncher> {
    Box::new(ProcessLauncher::new(config))
}

/// Launches one `sandbox_worker` process per sandbox, optionally inside a container.
pub struct ProcessLauncher {
    host_origin: String,
    mode: LaunchMode,
}

impl ProcessLauncher {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            host_origin: config.host_origin.clone(),
            mode: config.launch.clone(),
        }
    }

    fn process_command(&self, worker_bin: &Path) -> Command {
        let mut command = Command::new(worker_bin);
        command
            .env_clear()
            .env("PATH", WORKER_PATH)
            .env(HOST_ORIGIN_ENV, &self.host_origin);
        if let Ok(filter) = env::var("RUST_LOG") {
            command.env("RUST_LOG", filter);
        }
        command
    }

    fn container_command(
        &self,
        id: SandboxId,
        image: &str,
        runtime: &str,
        worker_bin: &Path,
    ) -> Command {
        let mut command = Command::new("docker");
        command
            .arg("run")
            .arg("--rm")
            .arg("-i")
            .arg(format!("--runtime={runtime}"))
            .arg("--network=none")
            .arg("--name")
            .arg(container_name(id))
            .arg("-v")
            .arg(format!("{}:{CONTAINER_WORKER_PATH}:ro", worker_bin.display()))
            .arg("-e")
            .arg(format!("{HOST_ORIGIN_ENV}={}", self.host_origin));
        if let Ok(filter) = env::var("RUST_LOG") {
            command.arg("-e").arg(format!("RUST_LOG={filter}"));
        }
        command.arg(image).arg(CONTAINER_WORKER_PATH);
        command
    }
}

impl SandboxLauncher for ProcessLauncher {
    fn launch(&self, port: MessagePort) -> Result<Box<dyn SandboxHandle>, HostError> {
        let id = SandboxId::new();
        let (mut command, cleanup) = match &self.mode {
            LaunchMode::Process { worker_bin } => {
                let worker_bin = resolve_worker_bin(worker_bin.as_deref())?;
                (self.process_command(&worker_bin), None)
            }
            LaunchMode::Container {
                image,
                runtime,
                worker_bin,
            } => {
                let worker_bin = resolve_worker_bin(worker_bin.as_deref())?;
                let mut cleanup = Command::new("docker");
                cleanup.arg("kill").arg(container_name(id));
                (
                    self.container_command(id, image, runtime, &worker_bin),
                    Some(cleanup),
                )
            }
        };
        let child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| HostError::Launch(format!("failed to spawn sandbox worker: {err}")))?;
        debug!(sandbox = %id, pid = child.id(), "sandbox launched");

        let client = SandboxClient::new(id, self.host_origin.clone(), child, port)?;
        let client = match cleanup {
            Some(cleanup) => client.with_cleanup(cleanup),
            None => client,
        };
        Ok(Box::new(client))
    }
}

fn container_name(id: SandboxId) -> String {
    format!("hedgehog-sandbox-{id}")
}

fn resolve_worker_bin(configured: Option<&Path>) -> Result<PathBuf, HostError> {
    if let Some(path) = configured {
        if !path.exists() {
            return Err(HostError::Launch(format!(
                "sandbox worker binary not found at {}",
                path.display()
            )));
        }
        return Ok(path.to_path_buf());
    }
    let current = env::current_exe()
        .map_err(|err| HostError::Launch(format!("failed to resolve current executable: {err}")))?;
    let mut worker = current
        .parent()
        .ok_or_else(|| HostError::Launch("failed to resolve executable directory".to_owned()))?
        .to_path_buf();
    worker.push(WORKER_BIN_NAME);
    if let Some(ext) = current.extension() {
        worker.set_extension(ext);
    }
    if !worker.exists() {
        return Err(HostError::Launch(format!(
            "sandbox worker binary not found at {}. Build it with `cargo build -p host --bin sandbox_worker`",
            worker.display()
        )));
    }
    Ok(worker)
}

/// Runs each sandbox on a thread of the host process.
///
/// There is no memory isolation and a runaway program cannot be killed:
/// terminating only disconnects the sandbox, whose later messages are then
/// rejected as stale.
pub struct InProcessLauncher {
    config: SandboxConfig,
}

impl InProcessLauncher {
    pub fn new(host_origin: impl Into<String>) -> Self {
        Self::with_config(SandboxConfig::new(host_origin))
    }

    pub fn with_config(config: SandboxConfig) -> Self {
        Self { config }
    }
}

impl SandboxLauncher for InProcessLauncher {
    fn launch(&self, port: MessagePort) -> Result<Box<dyn SandboxHandle>, HostError> {
        let id = SandboxId::new();
        let (sender, receiver) = mpsc::channel();
        let outbox = Arc::new(PortOutbox {
            source: id,
            origin: self.config.origin.clone(),
            port,
        });
        let config = self.config.clone();

        // The interpreter is not `Send`; the worker is built on its own thread.
        thread::Builder::new()
            .name(format!("sandbox-{id}"))
            .spawn(move || match Worker::new(config, outbox, receiver).serve() {
                Ok(state) => debug!(sandbox = %id, ?state, "sandbox finished"),
                Err(err) => warn!(sandbox = %id, error = %err, "sandbox failed"),
            })
            .map_err(|err| HostError::Launch(format!("failed to spawn sandbox thread: {err}")))?;

        Ok(Box::new(InProcessSandbox {
            id,
            host_origin: self.config.host_origin.clone(),
            sender: Some(sender),
        }))
    }
}

struct PortOutbox {
    source: SandboxId,
    origin: String,
    port: MessagePort,
}

impl Outbox for PortOutbox {
    fn post(&self, message: CommandMessage) -> Result<(), SandboxError> {
        let event = MessageEvent {
            data: message,
            origin: self.origin.clone(),
            source: self.source,
        };
        if self.port.post(event) {
            Ok(())
        } else {
            Err(SandboxError::Disconnected)
        }
    }
}

struct InProcessSandbox {
    id: SandboxId,
    host_origin: String,
    sender: Option<mpsc::Sender<WireEnvelope>>,
}

impl SandboxHandle for InProcessSandbox {
    fn id(&self) -> SandboxId {
        self.id
    }

    fn post_message(&mut self, message: CommandMessage) -> Result<(), HostError> {
        let sender = self.sender.as_ref().ok_or_else(|| HostError::Post {
            id: self.id,
            message: "sandbox terminated".to_owned(),
        })?;
        sender
            .send(WireEnvelope::new(self.host_origin.clone(), message))
            .map_err(|_| HostError::Post {
                id: self.id,
                message: "sandbox hung up".to_owned(),
            })
    }

    fn terminate(&mut self) {
        self.sender = None;
    }
}
