use std::collections::BTreeSet;
use std::fmt;

use uuid::Uuid;

use crate::{SandboxHandle, SandboxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStarted {
    pub run: RunId,
    pub sandbox: SandboxId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSnapshot {
    pub state: RunState,
    pub run: Option<RunId>,
    pub sandbox: Option<SandboxId>,
}

/// The sandbox attached to the current run.
pub struct ActiveSandbox {
    handle: Box<dyn SandboxHandle>,
    loaded: bool,
    pending: Option<String>,
    subscriptions: BTreeSet<String>,
}

impl ActiveSandbox {
    pub fn new(handle: Box<dyn SandboxHandle>, loaded: bool, code: String) -> Self {
        Self {
            handle,
            loaded,
            pending: Some(code),
            subscriptions: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> SandboxId {
        self.handle.id()
    }

    pub fn handle_mut(&mut self) -> &mut dyn SandboxHandle {
        self.handle.as_mut()
    }

    pub fn into_handle(self) -> Box<dyn SandboxHandle> {
        self.handle
    }

    pub fn mark_loaded(&mut self) {
        self.loaded = true;
    }

    /// Hands out the program exactly once, and only after the sandbox has loaded.
    pub fn take_execute(&mut self) -> Option<String> {
        if self.loaded { self.pending.take() } else { None }
    }

    pub fn execute_sent(&self) -> bool {
        self.pending.is_none()
    }

    /// Records that the program wants `event`. Returns `false` if it already did.
    pub fn subscribe(&mut self, event: impl Into<String>) -> bool {
        self.subscriptions.insert(event.into())
    }

    pub fn is_subscribed(&self, event: &str) -> bool {
        self.subscriptions.contains(event)
    }
}

/// Host-side state of the current run.
pub struct RunSession {
    state: RunState,
    run: Option<RunId>,
    sandbox: Option<ActiveSandbox>,
}

impl RunSession {
    pub fn new() -> Self {
        Self {
            state: RunState::Idle,
            run: None,
            sandbox: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.run
    }

    pub fn is_attached(&self) -> bool {
        self.sandbox.is_some()
    }

    /// Whether `id` is the sandbox of the current run.
    pub fn is_current(&self, id: SandboxId) -> bool {
        self.sandbox.as_ref().is_some_and(|active| active.id() == id)
    }

    pub fn sandbox_mut(&mut self) -> Option<&mut ActiveSandbox> {
        self.sandbox.as_mut()
    }

    pub fn begin(&mut self, run: RunId, sandbox: ActiveSandbox) {
        self.state = RunState::Running;
        self.run = Some(run);
        self.sandbox = Some(sandbox);
    }

    /// Detaches the sandbox and goes idle. Returns the detached sandbox, if any.
    pub fn end(&mut self) -> Option<ActiveSandbox> {
        self.state = RunState::Idle;
        self.run = None;
        self.sandbox.take()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            state: self.state,
            run: self.run,
            sandbox: self.sandbox.as_ref().map(ActiveSandbox::id),
        }
    }
}

impl Default for RunSession {
    fn default() -> Self {
        Self::new()
    }
}
