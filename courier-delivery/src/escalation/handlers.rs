use std::sync::Arc;

use courier_common::internal;
use courier_queue::{MemoryQueue, Queue};
use tokio::sync::mpsc;

use super::{ErrorHandler, MsgErrorInfo};

/// Drops the entries.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardHandler;

impl ErrorHandler for DiscardHandler {
    fn handle_error(&self, info: MsgErrorInfo) {
        internal!(
            level = DEBUG,
            "Discarding {} entries for {}: {}",
            info.entries().len(),
            info.destination(),
            info.cause()
        );
    }
}

/// Drops the entries after logging each of them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

impl ErrorHandler for LogHandler {
    fn handle_error(&self, info: MsgErrorInfo) {
        for entry in info.entries() {
            internal!(
                level = WARN,
                "Undeliverable entry {entry} for {}: {}",
                info.destination(),
                info.cause()
            );
        }
    }
}

/// Moves the entries into a dead-letter queue.
///
/// Entries the dead-letter queue cannot take are logged and dropped; a dead
/// letter is never escalated a second time.
#[derive(Debug, Clone)]
pub struct DeadLetterHandler {
    queue: Arc<MemoryQueue>,
}

impl DeadLetterHandler {
    #[must_use]
    pub const fn new(queue: Arc<MemoryQueue>) -> Self {
        Self { queue }
    }

    #[must_use]
    pub const fn queue(&self) -> &Arc<MemoryQueue> {
        &self.queue
    }
}

impl ErrorHandler for DeadLetterHandler {
    fn handle_error(&self, info: MsgErrorInfo) {
        for entry in info.entries() {
            match self.queue.put(entry.clone()) {
                Ok(()) => internal!(
                    level = INFO,
                    "Dead letter {entry} from {} ({})",
                    info.destination(),
                    info.cause()
                ),
                Err(e) => internal!(
                    level = ERROR,
                    "Lost dead letter {entry} from {}: {e}",
                    info.destination()
                ),
            }
        }
    }
}

/// Hands the report to an owner on another task.
#[derive(Debug, Clone)]
pub struct PropagateHandler {
    sender: mpsc::UnboundedSender<MsgErrorInfo>,
}

impl PropagateHandler {
    /// A handler and the receiving end the owner reads escalations from.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MsgErrorInfo>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ErrorHandler for PropagateHandler {
    fn handle_error(&self, info: MsgErrorInfo) {
        if let Err(mpsc::error::SendError(info)) = self.sender.send(info) {
            internal!(
                level = ERROR,
                "Owner of {} went away, dropping {} escalated entries: {}",
                info.destination(),
                info.entries().len(),
                info.cause()
            );
        }
    }
}
