use std::{
    fmt::{self, Display},
    sync::{Arc, LazyLock},
    time::{Duration, SystemTime},
};

use courier_cluster::Route;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

static GENERATOR: LazyLock<Mutex<ulid::Generator>> = LazyLock::new(|| Mutex::new(ulid::Generator::new()));

/// Identifier of a queued entry (a ULID).
///
/// Ids generated in one process increase strictly, so they order entries by
/// creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(ulid::Ulid);

impl EntryId {
    #[must_use]
    pub fn generate() -> Self {
        // Overflow needs 2^80 ids within one millisecond
        Self(
            GENERATOR
                .lock()
                .generate()
                .unwrap_or_else(|_| ulid::Ulid::new()),
        )
    }

    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.0
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery priority, `0` (lowest) to `9` (highest). Higher drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Self = Self(0);
    pub const LOW: Self = Self(3);
    pub const NORM: Self = Self(5);
    pub const HIGH: Self = Self(7);
    pub const MAX: Self = Self(9);

    /// Values above [`Priority::MAX`] are clamped.
    #[must_use]
    pub const fn new(value: u8) -> Self {
        if value > Self::MAX.0 {
            Self::MAX
        } else {
            Self(value)
        }
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORM
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message waiting for delivery to one destination.
///
/// Cloning is cheap: the payload is shared. The route is copied so a drain
/// worker can stamp its own hop onto the outgoing copy without touching the
/// queued original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    id: EntryId,
    priority: Priority,
    created: SystemTime,
    expiry: Option<SystemTime>,
    topic: Option<Arc<str>>,
    payload: Arc<[u8]>,
    route: Route,
}

impl QueueEntry {
    #[must_use]
    pub fn new(payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            id: EntryId::generate(),
            priority: Priority::default(),
            created: SystemTime::now(),
            expiry: None,
            topic: None,
            payload: payload.into(),
            route: Route::new(),
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Expire `ttl` after the entry was created.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expiry = self.created.checked_add(ttl);
        self
    }

    #[must_use]
    pub const fn with_expiry(mut self, expiry: SystemTime) -> Self {
        self.expiry = Some(expiry);
        self
    }

    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<Arc<str>>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    #[must_use]
    pub fn with_route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    #[must_use]
    pub const fn id(&self) -> EntryId {
        self.id
    }

    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub const fn created(&self) -> SystemTime {
        self.created
    }

    #[must_use]
    pub const fn expiry(&self) -> Option<SystemTime> {
        self.expiry
    }

    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub const fn route(&self) -> &Route {
        &self.route
    }

    pub const fn route_mut(&mut self) -> &mut Route {
        &mut self.route
    }

    /// Bytes the entry accounts for in size-limited queues and batches.
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }
}

impl Display for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[prio={}", self.id, self.priority)?;
        if let Some(topic) = &self.topic {
            write!(f, ", topic={topic}")?;
        }
        write!(f, ", bytes={}]", self.payload.len())
    }
}
