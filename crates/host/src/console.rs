//! Console pane model: a bounded transcript plus an [`EventHandler`] feeding it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use sandbox::protocol::{ExitPayload, OutputPayload, OutputStream};

use crate::SandboxId;
use crate::controller::EventHandler;
use crate::session::{RunId, RunStarted};

pub const CONSOLE_CAPACITY: usize = 100;

const HELP_TEXT: &str = "/help, /h    show this help\n/clear, /c   clear the console";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleItem {
    pub text: String,
    pub stream: OutputStream,
}

#[derive(Debug, Default)]
pub struct Console {
    items: VecDeque<ConsoleItem>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a line, dropping the oldest once the console is full.
    pub fn print(&mut self, text: impl Into<String>, stream: OutputStream) {
        if self.items.len() == CONSOLE_CAPACITY {
            self.items.pop_front();
        }
        self.items.push_back(ConsoleItem {
            text: text.into(),
            stream,
        });
    }

    /// Handles a line typed into the console. Input is echoed; slash commands are interpreted.
    pub fn submit(&mut self, input: &str) {
        self.print(input, OutputStream::Stdin);
        if !input.starts_with('/') {
            return;
        }
        match input {
            "/help" | "/h" => self.print(HELP_TEXT, OutputStream::Stdout),
            "/clear" | "/c" => self.clear(),
            _ => self.print(format!("Command not found: {input}"), OutputStream::Stderr),
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn items(&self) -> impl Iterator<Item = &ConsoleItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Shared console state written by the controller thread and read by the UI.
#[derive(Clone, Default)]
pub struct ConsoleHandler {
    console: Arc<Mutex<Console>>,
    running: Arc<AtomicBool>,
}

impl ConsoleHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn console(&self) -> MutexGuard<'_, Console> {
        self.console.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl EventHandler for ConsoleHandler {
    fn on_started(&mut self, _started: &RunStarted) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn on_output(&mut self, _source: &SandboxId, output: OutputPayload) {
        self.console().print(output.text, output.stream);
    }

    fn on_exit(&mut self, _source: &SandboxId, exit: ExitPayload) {
        if let Some(error) = exit.error {
            self.console().print(error, OutputStream::Stderr);
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn on_stopped(&mut self, _run: &RunId) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(console: &Console) -> Vec<(&str, OutputStream)> {
        console
            .items()
            .map(|item| (item.text.as_str(), item.stream))
            .collect()
    }

    #[test]
    fn keeps_only_the_last_hundred_items() {
        let mut console = Console::new();
        for n in 0..105 {
            console.print(n.to_string(), OutputStream::Stdout);
        }
        assert_eq!(console.len(), CONSOLE_CAPACITY);
        assert_eq!(console.items().next().unwrap().text, "5");
        assert_eq!(console.items().last().unwrap().text, "104");
    }

    #[test]
    fn slash_commands() {
        let mut console = Console::new();
        console.submit("drive()");
        console.submit("/fly");
        assert_eq!(
            texts(&console),
            vec![
                ("drive()", OutputStream::Stdin),
                ("/fly", OutputStream::Stdin),
                ("Command not found: /fly", OutputStream::Stderr),
            ]
        );

        console.submit("/h");
        assert_eq!(console.items().last().unwrap().text, HELP_TEXT);

        console.submit("/clear");
        assert!(console.is_empty());
    }

    #[test]
    fn handler_tracks_runs_and_prints_errors() {
        let mut handler = ConsoleHandler::new();
        let view = handler.clone();
        let sandbox = SandboxId::new();

        handler.on_started(&RunStarted {
            run: RunId::new(),
            sandbox,
        });
        assert!(view.is_running());

        handler.on_output(
            &sandbox,
            OutputPayload {
                text: "hello\n".to_owned(),
                stream: OutputStream::Stdout,
            },
        );
        handler.on_exit(
            &sandbox,
            ExitPayload {
                error: Some("ZeroDivisionError: division by zero".to_owned()),
            },
        );

        assert!(!view.is_running());
        assert_eq!(
            texts(&view.console()),
            vec![
                ("hello\n", OutputStream::Stdout),
                ("ZeroDivisionError: division by zero", OutputStream::Stderr),
            ]
        );
    }
}
