//! Error types for the courier-queue crate.

use thiserror::Error;

use crate::EntryId;

/// Errors returned by [`Queue`](crate::Queue) implementations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is bounded and has no room for the entry. This is a
    /// capacity problem, never a connectivity one.
    #[error("Queue {queue} is full: {len}/{capacity} entries")]
    Full {
        queue: String,
        len: usize,
        capacity: usize,
    },

    /// The queue's byte budget would be exceeded by the entry.
    #[error("Queue {queue} is full: {bytes}+{entry_bytes} bytes exceeds {max_bytes}")]
    BytesExceeded {
        queue: String,
        bytes: usize,
        entry_bytes: usize,
        max_bytes: usize,
    },

    #[error("Queue {0} is shut down")]
    Shutdown(String),

    #[error("Entry {0} is already queued")]
    AlreadyExists(EntryId),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Whether the queue rejected the entry for lack of room.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        matches!(self, Self::Full { .. } | Self::BytesExceeded { .. })
    }
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
