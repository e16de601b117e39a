//! The host controller: one run at a time, one fresh sandbox per run.
//!
//! [`HostController`] is plain single-threaded state. [`spawn_host_controller`]
//! moves it onto its own thread, where UI requests and inbound sandbox messages
//! are processed in arrival order from a single mailbox.

use std::thread;

use sandbox::protocol::{EventPayload, ExitPayload, HostCommand, OutputPayload, SandboxEvent};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::error::HostError;
use crate::event::{self, Mail, Mailbox, MessageEvent, MessagePort, Requests};
use crate::pool::{PooledSandbox, SandboxPool};
use crate::session::{ActiveSandbox, RunId, RunSession, RunSnapshot, RunStarted};
use crate::{SandboxId, SandboxLauncher};

/// Receives everything the current sandbox reports. Handlers run on the
/// controller thread; a panicking handler takes the controller down with it.
pub trait EventHandler: Send {
    fn on_started(&mut self, started: &RunStarted);

    fn on_output(&mut self, source: &SandboxId, output: OutputPayload);

    fn on_exit(&mut self, source: &SandboxId, exit: ExitPayload);

    /// Called when a run is discarded before it reported `exit`.
    fn on_stopped(&mut self, _run: &RunId) {}

    /// Answers a host call made by the running program.
    fn on_call(
        &mut self,
        _source: &SandboxId,
        command: &str,
        _payload: Value,
    ) -> Result<Value, String> {
        Err(format!("unknown call {command}"))
    }
}

pub struct HostController {
    sandbox_origin: String,
    pool: SandboxPool,
    session: RunSession,
    handler: Box<dyn EventHandler>,
}

impl HostController {
    /// Builds a controller whose sandboxes deliver their messages to `port`.
    pub fn new(
        config: &HostConfig,
        launcher: Box<dyn SandboxLauncher>,
        handler: Box<dyn EventHandler>,
        port: MessagePort,
    ) -> Result<Self, HostError> {
        let pool = SandboxPool::new(launcher, port, config.pool_size)?;
        Ok(Self {
            sandbox_origin: config.sandbox_origin.clone(),
            pool,
            session: RunSession::new(),
            handler,
        })
    }

    /// Starts `code` in a fresh sandbox, discarding whatever was attached before.
    pub fn start(&mut self, code: impl Into<String>) -> Result<RunStarted, HostError> {
        if self.session.is_attached() {
            self.stop();
        }
        let PooledSandbox { handle, loaded } = self.pool.acquire()?;
        let started = RunStarted {
            run: RunId::new(),
            sandbox: handle.id(),
        };
        self.session
            .begin(started.run, ActiveSandbox::new(handle, loaded, code.into()));
        info!(run = %started.run, sandbox = %started.sandbox, loaded, "run started");
        self.handler.on_started(&started);
        self.flush_execute();
        Ok(started)
    }

    /// Discards the current sandbox. Returns `false` if nothing was attached.
    pub fn stop(&mut self) -> bool {
        let run = self.session.run_id();
        let Some(active) = self.session.end() else {
            return false;
        };
        let sandbox = active.id();
        self.pool.retire(active.into_handle());
        info!(sandbox = %sandbox, "run stopped");
        if let Some(run) = run {
            self.handler.on_stopped(&run);
        }
        true
    }

    /// The only inbound path. Messages from a foreign origin or from any
    /// sandbox other than the current one never reach the handler.
    pub fn on_message(&mut self, event: MessageEvent) {
        if event.origin != self.sandbox_origin {
            return;
        }
        let source = event.source;
        if !self.session.is_current(source) {
            if event.data.command == SandboxEvent::READY {
                self.pool.mark_loaded(source);
            }
            return;
        }

        let sandbox_event = match SandboxEvent::from_message(&event.data) {
            Ok(Some(sandbox_event)) => sandbox_event,
            Ok(None) => return,
            Err(err) => {
                debug!(sandbox = %source, error = %err, "dropping malformed message");
                return;
            }
        };

        match sandbox_event {
            SandboxEvent::Ready => {
                if let Some(active) = self.session.sandbox_mut() {
                    active.mark_loaded();
                }
                self.flush_execute();
            }
            SandboxEvent::Output(output) => self.handler.on_output(&source, output),
            SandboxEvent::Exit(exit) => {
                if let Some(active) = self.session.end() {
                    self.pool.retire(active.into_handle());
                }
                info!(sandbox = %source, success = exit.is_success(), "run exited");
                self.handler.on_exit(&source, exit);
            }
            SandboxEvent::Subscribe(subscription) => {
                if let Some(active) = self.session.sandbox_mut() {
                    debug!(sandbox = %source, event = %subscription.event, "sandbox subscribed");
                    active.subscribe(subscription.event);
                }
            }
            SandboxEvent::Call(call) => {
                let reply = match self.handler.on_call(&source, &call.command, call.payload) {
                    Ok(value) => HostCommand::Reply(value),
                    Err(error) => HostCommand::ErrorReply(error),
                };
                self.post(reply);
            }
        }
    }

    /// Pushes a named event to the current sandbox. Returns `false` unless the
    /// running program subscribed to `event`.
    pub fn emit(&mut self, event: &str, payload: Value) -> bool {
        let subscribed = self
            .session
            .sandbox_mut()
            .is_some_and(|active| active.is_subscribed(event));
        if !subscribed {
            return false;
        }
        self.post(HostCommand::Event(EventPayload {
            event: event.to_owned(),
            payload,
        }));
        true
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.session.snapshot()
    }

    /// Discards the current run and every pooled sandbox.
    pub fn shutdown(&mut self) {
        if let Some(active) = self.session.end() {
            let mut handle = active.into_handle();
            handle.terminate();
        }
        self.pool.shutdown();
    }

    fn flush_execute(&mut self) {
        let code = self.session.sandbox_mut().and_then(ActiveSandbox::take_execute);
        if let Some(code) = code {
            self.post(HostCommand::Execute(code));
        }
    }

    fn post(&mut self, command: HostCommand) {
        let Some(active) = self.session.sandbox_mut() else {
            return;
        };
        if let Err(err) = active.handle_mut().post_message(command.into_message()) {
            warn!(error = %err, "failed to post to sandbox");
        }
    }
}

pub(crate) enum HostRequest {
    Start {
        code: String,
        respond_to: oneshot::Sender<Result<RunStarted, HostError>>,
    },
    Stop {
        respond_to: oneshot::Sender<bool>,
    },
    Emit {
        event: String,
        payload: Value,
        respond_to: oneshot::Sender<bool>,
    },
    Snapshot {
        respond_to: oneshot::Sender<RunSnapshot>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Async front of a controller running on its own thread. The controller
/// shuts down once every clone of the handle is dropped.
#[derive(Clone)]
pub struct HostControllerHandle {
    requests: Requests,
}

impl HostControllerHandle {
    pub async fn start(&self, code: impl Into<String>) -> Result<RunStarted, HostError> {
        let (respond_to, response) = oneshot::channel();
        self.requests.send(HostRequest::Start {
            code: code.into(),
            respond_to,
        })?;
        response.await.map_err(|_| HostError::Unavailable)?
    }

    pub async fn stop(&self) -> Result<bool, HostError> {
        let (respond_to, response) = oneshot::channel();
        self.requests.send(HostRequest::Stop { respond_to })?;
        response.await.map_err(|_| HostError::Unavailable)
    }

    /// Resolves to `false` when no running program subscribed to `event`.
    pub async fn emit(
        &self,
        event: impl Into<String>,
        payload: Value,
    ) -> Result<bool, HostError> {
        let (respond_to, response) = oneshot::channel();
        self.requests.send(HostRequest::Emit {
            event: event.into(),
            payload,
            respond_to,
        })?;
        response.await.map_err(|_| HostError::Unavailable)
    }

    pub async fn snapshot(&self) -> Result<RunSnapshot, HostError> {
        let (respond_to, response) = oneshot::channel();
        self.requests.send(HostRequest::Snapshot { respond_to })?;
        response.await.map_err(|_| HostError::Unavailable)
    }

    pub async fn shutdown(&self) -> Result<(), HostError> {
        let (respond_to, response) = oneshot::channel();
        self.requests.send(HostRequest::Shutdown { respond_to })?;
        response.await.map_err(|_| HostError::Unavailable)
    }

    /// Port for delivering message events to the controller.
    pub fn port(&self) -> MessagePort {
        self.requests.port()
    }
}

pub fn spawn_host_controller(
    config: HostConfig,
    launcher: Box<dyn SandboxLauncher>,
    handler: Box<dyn EventHandler>,
) -> Result<HostControllerHandle, HostError> {
    let (requests, mailbox) = event::channel();
    let controller = HostController::new(&config, launcher, handler, requests.port())?;

    thread::Builder::new()
        .name("host-controller".to_owned())
        .spawn(move || run_controller_loop(controller, mailbox))
        .map_err(|err| HostError::Launch(format!("failed to spawn host controller: {err}")))?;

    Ok(HostControllerHandle { requests })
}

fn run_controller_loop(mut controller: HostController, mut mailbox: Mailbox) {
    let mut acknowledge = None;
    while let Some(mail) = mailbox.blocking_recv() {
        match mail {
            Mail::Event(event) => controller.on_message(event),
            Mail::Request(HostRequest::Start { code, respond_to }) => {
                let _ = respond_to.send(controller.start(code));
            }
            Mail::Request(HostRequest::Stop { respond_to }) => {
                let _ = respond_to.send(controller.stop());
            }
            Mail::Request(HostRequest::Emit {
                event,
                payload,
                respond_to,
            }) => {
                let _ = respond_to.send(controller.emit(&event, payload));
            }
            Mail::Request(HostRequest::Snapshot { respond_to }) => {
                let _ = respond_to.send(controller.snapshot());
            }
            Mail::Request(HostRequest::Shutdown { respond_to }) => {
                acknowledge = Some(respond_to);
                break;
            }
        }
    }
    controller.shutdown();
    if let Some(respond_to) = acknowledge {
        let _ = respond_to.send(());
    }
    debug!("host controller stopped");
}
