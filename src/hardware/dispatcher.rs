use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{execute, Command, CommandChannel, CommandError};

/// Fire-and-forget command sender.
///
/// Commands are queued to a single worker and executed in submission order,
/// so a limit change issued before a switch command reaches the device first.
/// The control loop never waits on a device; failures are logged and the
/// next rebalance pass decides again from fresh telemetry. A command that
/// gets no answer within the timeout is abandoned so the queue keeps moving.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl CommandDispatcher {
    pub fn spawn(
        channel: Arc<dyn CommandChannel>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(channel, rx, timeout, cancel.clone()));
        (Self { tx, cancel }, worker)
    }

    pub fn dispatch(&self, commands: Vec<Command>) {
        for command in commands {
            if self.cancel.is_cancelled() {
                debug!(entity = %command.entity(), "shutting down, command dropped");
                continue;
            }
            if let Err(e) = self.tx.send(command) {
                warn!(entity = %e.0.entity(), "command worker gone, command dropped");
            }
        }
    }
}

async fn run_worker(
    channel: Arc<dyn CommandChannel>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => {
                let Some(command) = next else { break };
                // an in-flight command is allowed to finish, up to the timeout
                let sent = tokio::time::timeout(timeout, execute(channel.as_ref(), &command))
                    .await
                    .unwrap_or_else(|_| Err(CommandError::Timeout(command.entity().to_string())));
                match sent {
                    Ok(()) => debug!(entity = %command.entity(), ?command, "command sent"),
                    Err(e) => warn!(entity = %command.entity(), error = %e, "command failed"),
                }
            }
        }
    }
    debug!("command worker stopped");
}
