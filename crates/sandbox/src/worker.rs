//! Lifecycle of one sandbox instance.
//!
//! A worker moves through `Unloaded → Ready → Executing → Terminated` and never
//! back: it accepts a single `execute`, evaluates it, and always reports one
//! `exit`. Inbound envelopes are accepted only from the configured host origin.
//!
//! A program that registered event handlers keeps executing after its body
//! returns. It handles pushed events until a handler fails or the host hangs up.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::protocol::{
    CallPayload, CommandMessage, EventPayload, ExitPayload, HostCommand, OutputPayload,
    OutputStream, SandboxEvent, SubscribePayload, WireEnvelope, target_matches,
};
use crate::runtime::{Evaluation, HostBridge, Runtime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Unloaded,
    Ready,
    Executing,
    Terminated,
}

/// Posts messages to the parent. Messages are always addressed to `"*"`.
pub trait Outbox: Send + Sync {
    fn post(&self, message: CommandMessage) -> Result<(), SandboxError>;
}

/// Writes one JSON envelope per line.
pub struct LineOutbox<W: Write + Send> {
    origin: String,
    writer: Mutex<W>,
}

impl<W: Write + Send> LineOutbox<W> {
    pub fn new(origin: impl Into<String>, writer: W) -> Self {
        Self {
            origin: origin.into(),
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> Outbox for LineOutbox<W> {
    fn post(&self, message: CommandMessage) -> Result<(), SandboxError> {
        let line = WireEnvelope::new(self.origin.clone(), message).to_line()?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| SandboxError::Post("outbox lock poisoned".to_owned()))?;
        writer
            .write_all(line.as_bytes())
            .map_err(|err| SandboxError::Post(format!("write failed: {err}")))?;
        writer
            .write_all(b"\n")
            .map_err(|err| SandboxError::Post(format!("write failed: {err}")))?;
        writer
            .flush()
            .map_err(|err| SandboxError::Post(format!("flush failed: {err}")))
    }
}

type Inbound = Arc<Mutex<Receiver<WireEnvelope>>>;

/// Events that arrived while the program was blocked in a call.
type Deferred = Arc<Mutex<VecDeque<EventPayload>>>;

pub struct Worker {
    config: SandboxConfig,
    outbox: Arc<dyn Outbox>,
    inbound: Inbound,
    deferred: Deferred,
    runtime: Option<Runtime>,
    state: SandboxState,
}

impl Worker {
    pub fn new(
        config: SandboxConfig,
        outbox: Arc<dyn Outbox>,
        inbound: Receiver<WireEnvelope>,
    ) -> Self {
        Self {
            config,
            outbox,
            inbound: Arc::new(Mutex::new(inbound)),
            deferred: Deferred::default(),
            runtime: None,
            state: SandboxState::Unloaded,
        }
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Prepares the runtime and announces readiness to the host.
    pub fn load(&mut self) -> Result<(), SandboxError> {
        if self.state != SandboxState::Unloaded {
            return Ok(());
        }
        let bridge = Arc::new(Connection {
            host_origin: self.config.host_origin.clone(),
            origin: self.config.origin.clone(),
            outbox: self.outbox.clone(),
            inbound: self.inbound.clone(),
            deferred: self.deferred.clone(),
        });
        self.runtime = Some(Runtime::new(&self.config, bridge)?);
        self.state = SandboxState::Ready;
        self.post(SandboxEvent::Ready)?;
        tracing::debug!("sandbox ready");
        Ok(())
    }

    /// Loads if needed, then handles inbound messages until the program has
    /// run or the host hangs up.
    pub fn serve(mut self) -> Result<SandboxState, SandboxError> {
        self.load()?;
        while self.state != SandboxState::Terminated {
            let Some(envelope) = self.next_envelope() else {
                tracing::debug!("host connection closed");
                if self.state == SandboxState::Executing {
                    self.state = SandboxState::Terminated;
                    if let Err(err) = self.post(SandboxEvent::Exit(ExitPayload::default())) {
                        tracing::debug!(error = %err, "exit not delivered");
                    }
                }
                break;
            };
            self.handle(envelope)?;
        }
        Ok(self.state)
    }

    pub fn handle(&mut self, envelope: WireEnvelope) -> Result<(), SandboxError> {
        if !accepts(&self.config.host_origin, &self.config.origin, &envelope) {
            return Ok(());
        }
        match HostCommand::from_message(&envelope.data) {
            Ok(Some(HostCommand::Execute(code))) => {
                if self.state == SandboxState::Ready {
                    self.dispatch_and_report(&code)?;
                    self.dispatch_deferred()?;
                } else {
                    tracing::warn!(state = ?self.state, "dropping execute; sandbox already used");
                }
            }
            Ok(Some(HostCommand::Reply(_) | HostCommand::ErrorReply(_))) => {
                tracing::debug!("dropping reply without a pending call");
            }
            Ok(Some(HostCommand::Event(event))) => {
                if self.state == SandboxState::Executing {
                    self.dispatch_event(event)?;
                    self.dispatch_deferred()?;
                } else {
                    tracing::debug!(event = %event.event, state = ?self.state, "dropping event");
                }
            }
            Ok(None) => {}
            Err(err) => tracing::debug!(error = %err, "dropping malformed command"),
        }
        Ok(())
    }

    fn dispatch_and_report(&mut self, code: &str) -> Result<(), SandboxError> {
        self.state = SandboxState::Executing;
        tracing::debug!(code_len = code.len(), "executing program");
        let outcome = match self.runtime.as_ref() {
            Some(runtime) => runtime.evaluate(code),
            None => Err(SandboxError::Exec("runtime not loaded".to_owned())),
        };
        self.settle(outcome)
    }

    fn dispatch_event(&mut self, event: EventPayload) -> Result<(), SandboxError> {
        tracing::debug!(event = %event.event, "dispatching event");
        let outcome = match self.runtime.as_ref() {
            Some(runtime) => runtime.dispatch_event(&event.event, &event.payload),
            None => Err(SandboxError::Exec("runtime not loaded".to_owned())),
        };
        self.settle(outcome)
    }

    fn dispatch_deferred(&mut self) -> Result<(), SandboxError> {
        while self.state == SandboxState::Executing {
            let next = self.deferred.lock().ok().and_then(|mut queue| queue.pop_front());
            let Some(event) = next else {
                break;
            };
            self.dispatch_event(event)?;
        }
        Ok(())
    }

    /// Reports `exit` unless the program returned cleanly and still has handlers.
    fn settle(&mut self, outcome: Result<Evaluation, SandboxError>) -> Result<(), SandboxError> {
        let exit = match outcome {
            Ok(Evaluation { error: None }) if self.is_listening() => {
                tracing::debug!("program listening for events");
                return Ok(());
            }
            Ok(evaluation) => ExitPayload {
                error: evaluation.error,
            },
            Err(err) => {
                tracing::error!(error = %err, "program evaluation failed");
                ExitPayload {
                    error: Some(err.to_string()),
                }
            }
        };
        self.state = SandboxState::Terminated;
        self.post(SandboxEvent::Exit(exit))
    }

    fn is_listening(&self) -> bool {
        self.runtime.as_ref().is_some_and(Runtime::is_listening)
    }

    fn next_envelope(&self) -> Option<WireEnvelope> {
        let receiver = self.inbound.lock().ok()?;
        receiver.recv().ok()
    }

    fn post(&self, event: SandboxEvent) -> Result<(), SandboxError> {
        self.outbox.post(event.into_message()?)
    }
}

fn accepts(host_origin: &str, origin: &str, envelope: &WireEnvelope) -> bool {
    envelope.origin == host_origin && target_matches(&envelope.target_origin, origin)
}

/// The program's view of the host.
struct Connection {
    host_origin: String,
    origin: String,
    outbox: Arc<dyn Outbox>,
    inbound: Inbound,
    deferred: Deferred,
}

impl HostBridge for Connection {
    fn output(&self, stream: OutputStream, text: &str) {
        let event = SandboxEvent::Output(OutputPayload {
            text: text.to_owned(),
            stream,
        });
        let result = event
            .into_message()
            .map_err(SandboxError::from)
            .and_then(|message| self.outbox.post(message));
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to post output");
        }
    }

    fn call(&self, command: &str, payload: Value) -> Result<Value, String> {
        let request = SandboxEvent::Call(CallPayload {
            command: command.to_owned(),
            payload,
        });
        request
            .into_message()
            .map_err(SandboxError::from)
            .and_then(|message| self.outbox.post(message))
            .map_err(|err| err.to_string())?;

        let receiver = self
            .inbound
            .lock()
            .map_err(|_| "inbound lock poisoned".to_owned())?;
        loop {
            let envelope = receiver
                .recv()
                .map_err(|_| SandboxError::Disconnected.to_string())?;
            if !accepts(&self.host_origin, &self.origin, &envelope) {
                continue;
            }
            match HostCommand::from_message(&envelope.data) {
                Ok(Some(HostCommand::Reply(value))) => return Ok(value),
                Ok(Some(HostCommand::ErrorReply(error))) => return Err(error),
                Ok(Some(HostCommand::Execute(_))) => {
                    tracing::warn!("dropping execute received while executing");
                }
                Ok(Some(HostCommand::Event(event))) => {
                    if let Ok(mut deferred) = self.deferred.lock() {
                        deferred.push_back(event);
                    }
                }
                Ok(None) => {}
                Err(err) => tracing::debug!(error = %err, "dropping malformed command"),
            }
        }
    }

    fn subscribe(&self, event: &str) {
        let request = SandboxEvent::Subscribe(SubscribePayload {
            event: event.to_owned(),
        });
        let result = request
            .into_message()
            .map_err(SandboxError::from)
            .and_then(|message| self.outbox.post(message));
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to post subscribe");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use serde_json::json;

    use super::*;
    use crate::protocol::{DEFAULT_HOST_ORIGIN, OPAQUE_ORIGIN};

    #[derive(Default)]
    struct RecordingOutbox {
        sent: Mutex<Vec<CommandMessage>>,
    }

    impl RecordingOutbox {
        fn events(&self) -> Vec<SandboxEvent> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|message| SandboxEvent::from_message(message).unwrap().unwrap())
                .collect()
        }

        fn exits(&self) -> Vec<ExitPayload> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    SandboxEvent::Exit(exit) => Some(exit),
                    _ => None,
                })
                .collect()
        }

        fn stdout(&self) -> String {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    SandboxEvent::Output(output) if output.stream == OutputStream::Stdout => {
                        Some(output.text)
                    }
                    _ => None,
                })
                .collect()
        }
    }

    impl Outbox for RecordingOutbox {
        fn post(&self, message: CommandMessage) -> Result<(), SandboxError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn from_host(command: HostCommand) -> WireEnvelope {
        WireEnvelope::new(DEFAULT_HOST_ORIGIN, command.into_message())
    }

    fn execute(code: &str) -> WireEnvelope {
        from_host(HostCommand::Execute(code.to_owned()))
    }

    fn event(name: &str, payload: Value) -> WireEnvelope {
        from_host(HostCommand::Event(EventPayload {
            event: name.to_owned(),
            payload,
        }))
    }

    fn run(inbound: Vec<WireEnvelope>) -> (SandboxState, Arc<RecordingOutbox>) {
        let outbox = Arc::new(RecordingOutbox::default());
        let (sender, receiver) = mpsc::channel();
        for envelope in inbound {
            sender.send(envelope).unwrap();
        }
        drop(sender);
        let worker = Worker::new(SandboxConfig::default(), outbox.clone(), receiver);
        let state = worker.serve().unwrap();
        (state, outbox)
    }

    #[test]
    fn ready_precedes_output_and_exit() {
        let (state, outbox) = run(vec![execute("print('hi')")]);
        assert_eq!(state, SandboxState::Terminated);
        let events = outbox.events();
        assert_eq!(events.first(), Some(&SandboxEvent::Ready));
        assert_eq!(
            events.last(),
            Some(&SandboxEvent::Exit(ExitPayload::default()))
        );
        assert_eq!(outbox.stdout(), "hi\n");
    }

    #[test]
    fn throwing_program_still_exits_once() {
        let (_, outbox) = run(vec![execute("raise Exception('boom')")]);
        let exits = outbox.exits();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].error.as_deref(), Some("Exception: boom"));
    }

    #[test]
    fn foreign_origin_is_dropped() {
        let mut forged = execute("print('pwned')");
        forged.origin = "https://evil.example".to_owned();
        let (state, outbox) = run(vec![forged]);
        assert_eq!(state, SandboxState::Ready);
        assert_eq!(outbox.events(), vec![SandboxEvent::Ready]);
    }

    #[test]
    fn mismatched_target_is_dropped() {
        let mut misaddressed = execute("print('x')");
        misaddressed.target_origin = "https://ide.example".to_owned();
        let (state, _) = run(vec![misaddressed]);
        assert_eq!(state, SandboxState::Ready);

        let mut addressed = execute("print('x')");
        addressed.target_origin = OPAQUE_ORIGIN.to_owned();
        let (state, _) = run(vec![addressed]);
        assert_eq!(state, SandboxState::Terminated);
    }

    #[test]
    fn second_execute_is_never_evaluated() {
        let outbox = Arc::new(RecordingOutbox::default());
        let (sender, receiver) = mpsc::channel();
        let mut worker = Worker::new(SandboxConfig::default(), outbox.clone(), receiver);
        worker.load().unwrap();
        worker.handle(execute("print('first')")).unwrap();
        worker.handle(execute("print('second')")).unwrap();
        drop(sender);

        assert_eq!(worker.state(), SandboxState::Terminated);
        assert_eq!(outbox.exits().len(), 1);
        assert_eq!(outbox.stdout(), "first\n");
    }

    #[test]
    fn unknown_and_stray_commands_are_ignored() {
        let (state, outbox) = run(vec![
            WireEnvelope::new(DEFAULT_HOST_ORIGIN, CommandMessage::new("telemetry", json!({}))),
            from_host(HostCommand::Reply(json!(1))),
            event("collision", json!(1)),
            execute("print('ok')"),
        ]);
        assert_eq!(state, SandboxState::Terminated);
        assert_eq!(outbox.stdout(), "ok\n");
    }

    #[test]
    fn call_waits_for_host_reply() {
        let mut forged = from_host(HostCommand::Reply(json!(1)));
        forged.origin = "https://evil.example".to_owned();
        let (_, outbox) = run(vec![
            execute("print(call('getAnalog', {'port': 2}))"),
            forged,
            from_host(HostCommand::Reply(json!(42))),
        ]);
        let events = outbox.events();
        assert!(events.contains(&SandboxEvent::Call(CallPayload {
            command: "getAnalog".to_owned(),
            payload: json!({"port": 2}),
        })));
        assert_eq!(outbox.stdout(), "42\n");
        assert_eq!(outbox.exits(), vec![ExitPayload::default()]);
    }

    #[test]
    fn call_error_reply_fails_the_program() {
        let (_, outbox) = run(vec![
            execute("call('setServo', {'port': 0, 'position': 500})"),
            from_host(HostCommand::ErrorReply("no robot".to_owned())),
        ]);
        let exits = outbox.exits();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].error.as_deref(), Some("RuntimeError: no robot"));
    }

    #[test]
    fn hangup_during_call_reports_exit() {
        let (state, outbox) = run(vec![execute("call('getDigital', {'port': 1})")]);
        assert_eq!(state, SandboxState::Terminated);
        let exits = outbox.exits();
        assert_eq!(exits.len(), 1);
        assert_eq!(
            exits[0].error.as_deref(),
            Some("RuntimeError: host connection closed")
        );
    }

    #[test]
    fn handlers_keep_the_program_running_until_hangup() {
        let (state, outbox) = run(vec![
            execute("def hit(data):\n    print('hit', data)\n\non('collision', hit)"),
            event("collision", json!(1)),
            event("timer", json!(0)),
            event("collision", json!(2)),
        ]);
        assert_eq!(state, SandboxState::Terminated);
        let events = outbox.events();
        assert_eq!(
            events[1],
            SandboxEvent::Subscribe(SubscribePayload {
                event: "collision".to_owned(),
            })
        );
        assert_eq!(outbox.stdout(), "hit 1\nhit 2\n");
        assert_eq!(outbox.exits(), vec![ExitPayload::default()]);
        assert_eq!(events.last(), Some(&SandboxEvent::Exit(ExitPayload::default())));
    }

    #[test]
    fn failing_handler_ends_the_program() {
        let (state, outbox) = run(vec![
            execute("def hit(data):\n    print('hit')\n    raise ValueError('crash')\n\non('collision', hit)"),
            event("collision", Value::Null),
            event("collision", Value::Null),
        ]);
        assert_eq!(state, SandboxState::Terminated);
        assert_eq!(outbox.stdout(), "hit\n");
        let exits = outbox.exits();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].error.as_deref(), Some("ValueError: crash"));
    }

    #[test]
    fn events_received_during_a_call_run_afterwards() {
        let (_, outbox) = run(vec![
            execute("def tick(data):\n    print('tick', data)\n\non('tick', tick)\nprint(call('getAnalog'))"),
            event("tick", json!(1)),
            from_host(HostCommand::Reply(json!(42))),
        ]);
        assert_eq!(outbox.stdout(), "42\ntick 1\n");
        assert_eq!(outbox.exits(), vec![ExitPayload::default()]);
    }

    #[test]
    fn line_outbox_writes_wildcard_envelopes() {
        let outbox = LineOutbox::new(OPAQUE_ORIGIN, Vec::new());
        outbox
            .post(SandboxEvent::Ready.into_message().unwrap())
            .unwrap();
        let bytes = outbox.writer.into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.ends_with('\n'));
        let envelope = WireEnvelope::from_line(&text).unwrap();
        assert_eq!(envelope.origin, OPAQUE_ORIGIN);
        assert_eq!(envelope.target_origin, "*");
        assert_eq!(envelope.data.command, "ready");
    }
}
