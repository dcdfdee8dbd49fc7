//! Workflow Loop
//!
//! Multi-producer, single-consumer command execution. Producers only
//! enqueue; one task dequeues and runs each command to completion before
//! taking the next, so connection state is never mutated concurrently.

use tokio::sync::mpsc;

use super::command::RealtimeCommand;
use super::manager::ConnectionManager;

/// Cloneable, non-blocking handle for submitting commands
#[derive(Clone, Debug)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<RealtimeCommand>,
}

impl CommandQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RealtimeCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CommandQueue { tx }, rx)
    }

    /// Append a command to the tail of the queue. Returns `false` once the
    /// loop has stopped.
    pub fn push(&self, command: RealtimeCommand) -> bool {
        match self.tx.send(command) {
            Ok(()) => true,
            Err(mpsc::error::SendError(command)) => {
                tracing::debug!("Workflow loop stopped, dropping {}", command.name());
                false
            }
        }
    }

    pub fn push_all(&self, commands: impl IntoIterator<Item = RealtimeCommand>) {
        for command in commands {
            self.push(command);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub(crate) struct WorkflowLoop {
    rx: mpsc::UnboundedReceiver<RealtimeCommand>,
    manager: ConnectionManager,
}

impl WorkflowLoop {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<RealtimeCommand>, manager: ConnectionManager) -> Self {
        WorkflowLoop { rx, manager }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!("Workflow loop started");

        while let Some(command) = self.rx.recv().await {
            let name = command.name();
            tracing::trace!("Executing {:?}", command);

            // A failed command is dropped; the loop keeps going
            if let Err(e) = self.manager.execute(command).await {
                tracing::error!(
                    "Command {} failed in state {}: {}",
                    name,
                    self.manager.state(),
                    e
                );
            }
        }

        tracing::debug!("Workflow loop stopped");
    }
}
