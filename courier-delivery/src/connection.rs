//! Per-destination connection health: ALIVE, POLLING, DEAD.
//!
//! The state machine only counts failures against the retry budget and tells
//! listeners about changes. Timers and reactions to a transition belong to the
//! [`DeliveryManager`](crate::DeliveryManager) that owns the state.

use std::{
    fmt::{self, Display},
    sync::Arc,
    time::Instant,
};

use courier_common::{Destination, internal};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionStateEnum {
    /// Normal delivery.
    Alive,
    /// Destination unreachable, reconnect timer active.
    Polling,
    /// Retry budget exhausted. Terminal until re-registered.
    Dead,
}

impl Display for ConnectionStateEnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Alive => "ALIVE",
            Self::Polling => "POLLING",
            Self::Dead => "DEAD",
        })
    }
}

/// Outcome of reporting a success or failure to a [`ConnectionState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub old: ConnectionStateEnum,
    pub new: ConnectionStateEnum,
    /// Consecutive failures counted against the retry budget after this
    /// transition.
    pub retry_counter: u32,
    pub error: Option<String>,
}

impl Transition {
    /// `true` if the state actually changed.
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.old != self.new
    }
}

/// Observer of connection state changes.
///
/// Runs synchronously on the task performing the transition, so it must not
/// block or perform I/O; hand long work off to another task.
pub trait ConnectionStatusListener: Send + Sync {
    fn state_changed(
        &self,
        destination: &Destination,
        old: ConnectionStateEnum,
        new: ConnectionStateEnum,
        error: Option<&str>,
    );
}

#[derive(Debug)]
struct Inner {
    state: ConnectionStateEnum,
    retry_counter: u32,
    last_error: Option<String>,
    since: Instant,
}

/// Connection state machine of one destination.
///
/// `retries` is the number of consecutive failures tolerated before giving up;
/// any negative value retries forever.
pub struct ConnectionState {
    destination: Destination,
    retries: i32,
    inner: Mutex<Inner>,
    // Held across computing a transition and notifying listeners, so listeners
    // observe transitions in the order they happened.
    transition: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn ConnectionStatusListener>>>,
}

impl ConnectionState {
    #[must_use]
    pub fn new(destination: Destination, retries: i32) -> Self {
        Self {
            destination,
            retries,
            inner: Mutex::new(Inner {
                state: ConnectionStateEnum::Alive,
                retry_counter: 0,
                last_error: None,
                since: Instant::now(),
            }),
            transition: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn destination(&self) -> &Destination {
        &self.destination
    }

    #[must_use]
    pub const fn retries(&self) -> i32 {
        self.retries
    }

    #[must_use]
    pub fn state(&self) -> ConnectionStateEnum {
        self.inner.lock().state
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state() == ConnectionStateEnum::Alive
    }

    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.state() == ConnectionStateEnum::Polling
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.state() == ConnectionStateEnum::Dead
    }

    #[must_use]
    pub fn retry_counter(&self) -> u32 {
        self.inner.lock().retry_counter
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// How long the destination has been in its current state.
    #[must_use]
    pub fn time_in_state(&self) -> std::time::Duration {
        self.inner.lock().since.elapsed()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionStatusListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove a listener previously added, compared by pointer.
    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionStatusListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    fn retry_allowed(&self, retry_counter: u32) -> bool {
        u32::try_from(self.retries).map_or(true, |retries| retry_counter < retries)
    }

    /// Count a transport failure.
    ///
    /// ALIVE and POLLING move to POLLING while the budget lasts and to DEAD
    /// once it is used up. Returns `None` if the destination is already DEAD.
    pub fn record_failure(&self, error: &str) -> Option<Transition> {
        let _serialized = self.transition.lock();

        let transition = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionStateEnum::Dead {
                return None;
            }

            let old = inner.state;
            let new = if self.retry_allowed(inner.retry_counter) {
                inner.retry_counter += 1;
                ConnectionStateEnum::Polling
            } else {
                ConnectionStateEnum::Dead
            };

            if new != old {
                inner.since = Instant::now();
            }
            inner.state = new;
            inner.last_error = Some(error.to_string());

            Transition {
                old,
                new,
                retry_counter: inner.retry_counter,
                error: Some(error.to_string()),
            }
        };

        self.notify(&transition);
        Some(transition)
    }

    /// Count a successful send or ping.
    ///
    /// POLLING returns to ALIVE and the retry counter resets. Returns `None`
    /// when nothing changed (already ALIVE, or DEAD which is terminal).
    pub fn record_success(&self) -> Option<Transition> {
        let _serialized = self.transition.lock();

        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionStateEnum::Alive => {
                    inner.retry_counter = 0;
                    return None;
                }
                ConnectionStateEnum::Dead => return None,
                ConnectionStateEnum::Polling => {}
            }

            inner.state = ConnectionStateEnum::Alive;
            inner.retry_counter = 0;
            inner.last_error = None;
            inner.since = Instant::now();

            Transition {
                old: ConnectionStateEnum::Polling,
                new: ConnectionStateEnum::Alive,
                retry_counter: 0,
                error: None,
            }
        };

        self.notify(&transition);
        Some(transition)
    }

    fn notify(&self, transition: &Transition) {
        if !transition.is_change() {
            return;
        }

        internal!(
            level = INFO,
            "Destination {} changed from {} to {} (retry {}/{}){}",
            self.destination,
            transition.old,
            transition.new,
            transition.retry_counter,
            self.retries,
            transition
                .error
                .as_deref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default()
        );

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.state_changed(
                &self.destination,
                transition.old,
                transition.new,
                transition.error.as_deref(),
            );
        }
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionState")
            .field("destination", &self.destination)
            .field("state", &inner.state)
            .field("retry_counter", &inner.retry_counter)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}
