//! Terminal handling of entries that can neither be delivered nor retried.

mod handlers;

use std::{
    fmt,
    sync::{Arc, Weak},
};

use courier_cluster::RouteError;
use courier_common::Destination;
use courier_queue::{MemoryQueue, Queue, QueueEntry, QueueError};
use serde::Deserialize;
use thiserror::Error;

pub use handlers::{DeadLetterHandler, DiscardHandler, LogHandler, PropagateHandler};

/// Why a batch was escalated.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EscalationCause {
    /// The connection went DEAD after `retries` consecutive failures.
    #[error("Retries exhausted after {retries} attempt(s): {last_error}")]
    RetryExhausted { retries: u32, last_error: String },

    /// The destination refused the entries.
    #[error("Rejected by destination: {0}")]
    Rejected(String),

    /// A bounded queue had no room for the entry.
    #[error("Queue full: {0}")]
    QueueFull(QueueError),

    /// The entry carried a route the local node cannot stamp.
    #[error("Malformed route: {0}")]
    IllegalRoute(RouteError),

    /// The access filter failed on the entry.
    #[error("Access filter failed: {0}")]
    Filter(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// What the framework hands to an [`ErrorHandler`].
///
/// Immutable once built and always carries a cause.
#[derive(Clone)]
pub struct MsgErrorInfo {
    destination: Destination,
    entries: Vec<QueueEntry>,
    queue: Option<Weak<dyn Queue>>,
    cause: EscalationCause,
}

impl MsgErrorInfo {
    /// A missing cause is recorded as an unknown internal error.
    #[must_use]
    pub fn new(
        destination: Destination,
        entries: Vec<QueueEntry>,
        queue: Option<Weak<dyn Queue>>,
        cause: Option<EscalationCause>,
    ) -> Self {
        Self {
            destination,
            entries,
            queue,
            cause: cause.unwrap_or_else(|| EscalationCause::Internal("reason is not known".to_string())),
        }
    }

    #[must_use]
    pub const fn destination(&self) -> &Destination {
        &self.destination
    }

    #[must_use]
    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    /// The queue the entries came from, if it is still alive.
    #[must_use]
    pub fn queue(&self) -> Option<Arc<dyn Queue>> {
        self.queue.as_ref().and_then(Weak::upgrade)
    }

    #[must_use]
    pub const fn cause(&self) -> &EscalationCause {
        &self.cause
    }
}

impl fmt::Debug for MsgErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgErrorInfo")
            .field("destination", &self.destination)
            .field("entries", &self.entries.len())
            .field("queue", &self.queue().map(|q| q.name().to_string()))
            .field("cause", &self.cause)
            .finish()
    }
}

/// Terminal sink for undeliverable entries.
///
/// `handle_error` is called exactly once per unrecoverable batch and never for
/// a destination that is ALIVE or still within its retry budget.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, info: MsgErrorInfo);

    /// Release whatever the handler holds.
    fn shutdown(&self) {}
}

/// Handler selection in destination configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum EscalationConfig {
    Discard,
    #[default]
    Log,
    /// Write to the broker's shared dead-letter queue.
    DeadLetter,
}

impl EscalationConfig {
    #[must_use]
    pub fn build(self, dead_letters: &Arc<MemoryQueue>) -> Arc<dyn ErrorHandler> {
        match self {
            Self::Discard => Arc::new(DiscardHandler),
            Self::Log => Arc::new(LogHandler),
            Self::DeadLetter => Arc::new(DeadLetterHandler::new(dead_letters.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cause_is_synthesized() {
        let info = MsgErrorInfo::new(Destination::new("callback:joe"), Vec::new(), None, None);
        assert_eq!(
            info.cause(),
            &EscalationCause::Internal("reason is not known".to_string())
        );
        assert!(info.queue().is_none());
    }

    #[test]
    fn test_queue_handle_does_not_keep_queue_alive() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new("callback:joe"));
        let info = MsgErrorInfo::new(
            Destination::new("callback:joe"),
            Vec::new(),
            Some(Arc::downgrade(&queue)),
            Some(EscalationCause::Rejected("no".to_string())),
        );

        assert_eq!(info.queue().map(|q| q.name().to_string()), Some("callback:joe".to_string()));
        drop(queue);
        assert!(info.queue().is_none());
    }

    #[test]
    fn test_cause_display() {
        let cause = EscalationCause::RetryExhausted {
            retries: 2,
            last_error: "Connection failed: refused".to_string(),
        };
        assert_eq!(
            cause.to_string(),
            "Retries exhausted after 2 attempt(s): Connection failed: refused"
        );
    }

    #[test]
    fn test_escalation_config_deserialize() {
        let config: EscalationConfig = ron::from_str("DeadLetter").unwrap();
        assert_eq!(config, EscalationConfig::DeadLetter);
        assert_eq!(EscalationConfig::default(), EscalationConfig::Log);
    }
}
