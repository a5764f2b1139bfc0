use std::{
    cmp::Reverse,
    collections::BTreeMap,
    fmt,
    sync::{
        Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use ahash::AHashMap;
use courier_common::incoming;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::{
    EntryId, PeekLimit, Priority, QueueEntry, QueueError, Result,
    r#trait::{PutListener, Queue},
};

/// Sort key: highest priority first, then creation order.
type Slot = (Reverse<Priority>, EntryId);

#[derive(Debug, Default)]
struct Entries {
    by_slot: BTreeMap<Slot, QueueEntry>,
    slots: AHashMap<EntryId, Slot>,
    bytes: usize,
}

/// Limits of a [`MemoryQueue`], as read from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct MemoryQueueConfig {
    /// Maximum number of entries (None = unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
    /// Maximum payload bytes across all entries (None = unlimited)
    #[serde(default)]
    pub max_bytes: Option<usize>,
}

/// In-memory queue
///
/// Entries live in a `BTreeMap` keyed by (descending priority, entry id).
/// Ids grow with creation time, so the map's order is the delivery order,
/// entries of equal priority stay first-in first-out, and an entry that is
/// taken out and put back returns to its original place.
///
/// # Capacity Management
/// With a capacity or byte budget configured, `put` fails with
/// [`QueueError::Full`] or [`QueueError::BytesExceeded`] instead of growing.
///
/// # Concurrency
/// A `parking_lot::RwLock` guards the entries. Put listeners are invoked after
/// the lock has been released.
pub struct MemoryQueue {
    name: String,
    entries: RwLock<Entries>,
    config: MemoryQueueConfig,
    shutdown: AtomicBool,
    listeners: RwLock<Vec<Weak<dyn PutListener>>>,
}

impl MemoryQueue {
    /// Create an unbounded queue
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, MemoryQueueConfig::default())
    }

    /// Create a queue holding at most `capacity` entries
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self::with_config(
            name,
            MemoryQueueConfig {
                capacity: Some(capacity),
                max_bytes: None,
            },
        )
    }

    #[must_use]
    pub fn with_config(name: impl Into<String>, config: MemoryQueueConfig) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(Entries::default()),
            config,
            shutdown: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.config.capacity
    }

    /// Drop every entry, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let removed = entries.by_slot.len();
        entries.by_slot.clear();
        entries.slots.clear();
        entries.bytes = 0;
        removed
    }

    fn check_room(&self, entries: &Entries, entry: &QueueEntry) -> Result<()> {
        if let Some(capacity) = self.config.capacity
            && entries.by_slot.len() >= capacity
        {
            return Err(QueueError::Full {
                queue: self.name.clone(),
                len: entries.by_slot.len(),
                capacity,
            });
        }

        if let Some(max_bytes) = self.config.max_bytes
            && entries.bytes.saturating_add(entry.size()) > max_bytes
        {
            return Err(QueueError::BytesExceeded {
                queue: self.name.clone(),
                bytes: entries.bytes,
                entry_bytes: entry.size(),
                max_bytes,
            });
        }

        Ok(())
    }

    fn notify(&self, entry: &QueueEntry) {
        let listeners: Vec<_> = {
            let mut listeners = self.listeners.write();
            listeners.retain(|listener| listener.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };

        for listener in listeners {
            listener.on_put(&self.name, entry);
        }
    }
}

impl fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("config", &self.config)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, entry: QueueEntry) -> Result<()> {
        if self.is_shutdown() {
            return Err(QueueError::Shutdown(self.name.clone()));
        }

        {
            let mut entries = self.entries.write();
            if entries.slots.contains_key(&entry.id()) {
                return Err(QueueError::AlreadyExists(entry.id()));
            }
            self.check_room(&entries, &entry)?;

            let slot = (Reverse(entry.priority()), entry.id());
            entries.bytes += entry.size();
            entries.slots.insert(entry.id(), slot);
            entries.by_slot.insert(slot, entry.clone());
        }

        incoming!("Queued {entry} on {}", self.name);
        self.notify(&entry);

        Ok(())
    }

    fn peek_same_priority(&self, limit: PeekLimit) -> Result<Vec<QueueEntry>> {
        let entries = self.entries.read();
        let Some(top) = entries.by_slot.values().next().map(QueueEntry::priority) else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        let mut bytes = 0;
        for entry in entries.by_slot.values() {
            if entry.priority() != top || !limit.admits(batch.len(), bytes, entry.size()) {
                break;
            }
            bytes += entry.size();
            batch.push(entry.clone());
        }

        Ok(batch)
    }

    fn peek(&self, limit: PeekLimit) -> Result<Vec<QueueEntry>> {
        let entries = self.entries.read();

        let mut batch = Vec::new();
        let mut bytes = 0;
        for entry in entries.by_slot.values() {
            if !limit.admits(batch.len(), bytes, entry.size()) {
                break;
            }
            bytes += entry.size();
            batch.push(entry.clone());
        }

        Ok(batch)
    }

    fn remove(&self, ids: &[EntryId]) -> Result<usize> {
        let mut entries = self.entries.write();
        let mut removed = 0;

        for id in ids {
            if let Some(slot) = entries.slots.remove(id)
                && let Some(entry) = entries.by_slot.remove(&slot)
            {
                entries.bytes = entries.bytes.saturating_sub(entry.size());
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn len(&self) -> usize {
        self.entries.read().by_slot.len()
    }

    fn num_bytes(&self) -> usize {
        self.entries.read().bytes
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn add_put_listener(&self, listener: Weak<dyn PutListener>) {
        self.listeners.write().push(listener);
    }
}
