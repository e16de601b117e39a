use std::collections::VecDeque;

use tracing::warn;

use crate::error::HostError;
use crate::event::MessagePort;
use crate::{SandboxHandle, SandboxId, SandboxLauncher};

pub struct PooledSandbox {
    pub handle: Box<dyn SandboxHandle>,
    /// Whether the sandbox has already posted `ready`.
    pub loaded: bool,
}

/// Keeps fresh, never-used sandboxes warm so a run does not wait for a cold start.
/// A sandbox leaves the pool at most once and is never returned to it.
pub struct SandboxPool {
    launcher: Box<dyn SandboxLauncher>,
    port: MessagePort,
    idle: VecDeque<PooledSandbox>,
    target_idle: usize,
}

impl SandboxPool {
    pub fn new(
        launcher: Box<dyn SandboxLauncher>,
        port: MessagePort,
        target_idle: usize,
    ) -> Result<Self, HostError> {
        let mut pool = Self {
            launcher,
            port,
            idle: VecDeque::new(),
            target_idle,
        };
        pool.refill_strict()?;
        Ok(pool)
    }

    pub fn acquire(&mut self) -> Result<PooledSandbox, HostError> {
        let sandbox = match self.idle.pop_front() {
            Some(sandbox) => sandbox,
            None => self.launch()?,
        };
        self.refill_best_effort();
        Ok(sandbox)
    }

    pub fn retire(&mut self, mut handle: Box<dyn SandboxHandle>) {
        handle.terminate();
        self.refill_best_effort();
    }

    /// Records a `ready` from an idle sandbox. Returns `false` if `id` is not pooled.
    pub fn mark_loaded(&mut self, id: SandboxId) -> bool {
        match self.idle.iter_mut().find(|sandbox| sandbox.handle.id() == id) {
            Some(sandbox) => {
                sandbox.loaded = true;
                true
            }
            None => false,
        }
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn shutdown(&mut self) {
        for mut sandbox in self.idle.drain(..) {
            sandbox.handle.terminate();
        }
    }

    fn launch(&self) -> Result<PooledSandbox, HostError> {
        let handle = self.launcher.launch(self.port.clone())?;
        Ok(PooledSandbox {
            handle,
            loaded: false,
        })
    }

    fn refill_strict(&mut self) -> Result<(), HostError> {
        while self.idle.len() < self.target_idle {
            let sandbox = self.launch()?;
            self.idle.push_back(sandbox);
        }
        Ok(())
    }

    fn refill_best_effort(&mut self) {
        while self.idle.len() < self.target_idle {
            match self.launch() {
                Ok(sandbox) => self.idle.push_back(sandbox),
                Err(err) => {
                    warn!(error = %err, "sandbox pool refill failed");
                    break;
                }
            }
        }
    }
}

impl Drop for SandboxPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
