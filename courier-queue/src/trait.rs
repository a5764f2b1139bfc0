use std::{fmt::Debug, sync::Weak};

use serde::Deserialize;

use crate::{EntryId, QueueEntry, Result};

/// Upper bounds for a single peek.
///
/// A byte limit never yields an empty result while entries are available: the
/// first entry is always returned, even when it alone exceeds the limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PeekLimit {
    #[serde(default)]
    pub max_entries: Option<usize>,
    #[serde(default)]
    pub max_bytes: Option<usize>,
}

impl PeekLimit {
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            max_entries: None,
            max_bytes: None,
        }
    }

    #[must_use]
    pub const fn entries(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            max_bytes: None,
        }
    }

    /// Build from signed configuration values where any negative number
    /// means "no limit".
    #[must_use]
    pub fn from_signed(max_entries: i64, max_bytes: i64) -> Self {
        Self {
            max_entries: usize::try_from(max_entries).ok(),
            max_bytes: usize::try_from(max_bytes).ok(),
        }
    }

    /// Whether one more entry of `entry_bytes` fits after `taken` entries
    /// totalling `bytes`.
    #[must_use]
    pub fn admits(&self, taken: usize, bytes: usize, entry_bytes: usize) -> bool {
        if taken == 0 {
            return self.max_entries != Some(0);
        }

        self.max_entries.is_none_or(|max| taken < max)
            && self
                .max_bytes
                .is_none_or(|max| bytes.saturating_add(entry_bytes) <= max)
    }
}

/// Notified after entries were added to a queue.
///
/// Called on the publishing thread once the queue's locks are released.
/// Implementations must return quickly.
pub trait PutListener: Send + Sync {
    fn on_put(&self, queue: &str, entry: &QueueEntry);
}

/// Ordered, priority-aware container of entries waiting for one destination.
///
/// Many publishers may `put` concurrently; a single drain worker consumes
/// through `peek_same_priority` followed by `remove`.
pub trait Queue: Send + Sync + Debug {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    /// Add an entry.
    ///
    /// # Errors
    ///
    /// [`QueueError::Full`](crate::QueueError::Full) or
    /// [`QueueError::BytesExceeded`](crate::QueueError::BytesExceeded) when
    /// bounded and out of room, [`QueueError::Shutdown`](crate::QueueError::Shutdown)
    /// after [`Queue::shutdown`].
    fn put(&self, entry: QueueEntry) -> Result<()>;

    /// The leading run of entries that share the highest priority, oldest
    /// first. Entries stay queued until removed.
    ///
    /// # Errors
    ///
    /// Implementation specific storage errors.
    fn peek_same_priority(&self, limit: PeekLimit) -> Result<Vec<QueueEntry>>;

    /// Entries across all priorities, highest first.
    ///
    /// # Errors
    ///
    /// Implementation specific storage errors.
    fn peek(&self, limit: PeekLimit) -> Result<Vec<QueueEntry>>;

    /// Remove entries by id, returning how many were present.
    ///
    /// # Errors
    ///
    /// Implementation specific storage errors.
    fn remove(&self, ids: &[EntryId]) -> Result<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn num_bytes(&self) -> usize;

    fn is_shutdown(&self) -> bool;

    /// Reject further puts. Queued entries remain readable.
    fn shutdown(&self);

    /// Register for put notifications. Dropped listeners are skipped.
    fn add_put_listener(&self, listener: Weak<dyn PutListener>);
}
