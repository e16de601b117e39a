use std::io::{self, BufRead};
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread;

use sandbox::SandboxConfig;
use sandbox::protocol::WireEnvelope;
use sandbox::worker::{LineOutbox, Worker};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let config = SandboxConfig::from_env();
    tracing::debug!(host_origin = %config.host_origin, "sandbox worker starting");

    let (sender, receiver) = mpsc::channel();
    thread::Builder::new()
        .name("sandbox-stdin".to_owned())
        .spawn(move || read_envelopes(sender))?;

    let outbox = Arc::new(LineOutbox::new(config.origin.clone(), io::stdout()));
    let state = Worker::new(config, outbox, receiver).serve()?;
    tracing::debug!(?state, "sandbox worker exiting");
    Ok(())
}

fn read_envelopes(sender: Sender<WireEnvelope>) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                tracing::debug!(error = %err, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let envelope = match WireEnvelope::from_line(&line) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(error = %err, "dropping undecodable line");
                continue;
            }
        };
        if sender.send(envelope).is_err() {
            break;
        }
    }
}
