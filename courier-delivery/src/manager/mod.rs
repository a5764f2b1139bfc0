//! Per-destination dispatch: activation, drain workers, timers and shutdown.
//!
//! ## Lifecycle
//!
//! 1. [`DeliveryManagerBuilder::register`] resolves the interceptor, claims the
//!    destination in the [`BrokerContext`] and pings the transport. A failed
//!    ping starts the destination in POLLING and consumes one retry.
//! 2. Every `put` on the queue calls [`DeliveryManager::activate`], which
//!    schedules at most one drain worker on the shared [`WorkerPool`].
//! 3. The worker drains batches until the interceptor returns nothing, the
//!    transport fails or the manager shuts down.
//! 4. [`DeliveryManager::shutdown`] stops at the next batch boundary and waits
//!    for the in-flight batch.
//!
//! [`WorkerPool`]: crate::WorkerPool

mod drain;
mod timer;

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::SystemTime,
};

use courier_common::{Destination, internal, outgoing};
use courier_queue::{EntryId, MemoryQueue, Queue, QueueEntry};
use parking_lot::Mutex;
use tokio::sync::Notify;

pub use drain::CycleEnd;
use timer::Timers;

use crate::{
    BrokerContext, ConnectionState, DeliveryError, DeliveryInterceptor, DeliveryStats,
    DispatchConfig, ErrorHandler, EscalationCause, FilterBinding, MsgErrorInfo, Outcome,
    StatsSnapshot, Transport,
};

/// Builds and registers a [`DeliveryManager`].
pub struct DeliveryManagerBuilder {
    destination: Destination,
    transport: Arc<dyn Transport>,
    config: DispatchConfig,
    queue: Option<Arc<dyn Queue>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    filter: Option<FilterBinding>,
}

impl DeliveryManagerBuilder {
    #[must_use]
    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// The queue to drain. Defaults to an unbounded [`MemoryQueue`] named after
    /// the destination.
    #[must_use]
    pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Overrides the handler built from [`DispatchConfig::escalation`].
    #[must_use]
    pub fn error_handler(mut self, error_handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: FilterBinding) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Create the manager and start dispatching.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Config`] for invalid settings,
    /// [`DeliveryError::Plugin`] if the interceptor is unknown or refuses the
    /// destination, [`DeliveryError::AlreadyRegistered`] if another live
    /// manager serves the destination.
    pub async fn register(self, context: &Arc<BrokerContext>) -> Result<Arc<DeliveryManager>, DeliveryError> {
        self.config.validate()?;

        let interceptor = context
            .interceptors()
            .get_or_create(self.config.interceptor_key())?;

        let error_handler = self
            .error_handler
            .unwrap_or_else(|| self.config.escalation.build(context.dead_letters()));

        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(MemoryQueue::new(self.destination.to_string())));

        let connection = ConnectionState::new(self.destination.clone(), self.config.retries);

        let manager = Arc::new_cyclic(|this| DeliveryManager {
            destination: self.destination,
            context: Arc::clone(context),
            config: self.config,
            queue,
            connection,
            transport: self.transport,
            interceptor,
            error_handler,
            filter: self.filter,
            draining: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            dispatcher_active: AtomicBool::new(true),
            timers: Mutex::new(Timers::default()),
            stats: DeliveryStats::default(),
            idle: Notify::new(),
            this: this.clone(),
        });

        context.register_manager(&manager.destination, manager.this.clone())?;

        if let Err(e) = manager.interceptor.add_delivery_manager(&manager) {
            context.deregister_manager(&manager.destination, &manager.this);
            return Err(e.into());
        }

        let listener: Weak<dyn courier_queue::PutListener> = manager.this.clone();
        manager.queue.add_put_listener(listener);

        internal!(
            level = INFO,
            "Registered {} with queue {} ({} entries), interceptor {}",
            manager.destination,
            manager.queue.name(),
            manager.queue.len(),
            manager.config.interceptor_key()
        );

        manager.connect().await;
        manager.activate();

        Ok(manager)
    }
}

/// Dispatches the queue of one destination through its transport.
pub struct DeliveryManager {
    destination: Destination,
    context: Arc<BrokerContext>,
    config: DispatchConfig,
    queue: Arc<dyn Queue>,
    connection: ConnectionState,
    transport: Arc<dyn Transport>,
    interceptor: Arc<dyn DeliveryInterceptor>,
    error_handler: Arc<dyn ErrorHandler>,
    filter: Option<FilterBinding>,

    /// Lease of the single drain worker.
    draining: AtomicBool,
    shutdown: AtomicBool,
    dispatcher_active: AtomicBool,

    timers: Mutex<Timers>,
    stats: DeliveryStats,
    /// Signalled whenever the drain lease is released.
    idle: Notify,
    this: Weak<Self>,
}

impl DeliveryManager {
    #[must_use]
    pub fn builder(destination: Destination, transport: Arc<dyn Transport>) -> DeliveryManagerBuilder {
        DeliveryManagerBuilder {
            destination,
            transport,
            config: DispatchConfig::default(),
            queue: None,
            error_handler: None,
            filter: None,
        }
    }

    #[must_use]
    pub const fn destination(&self) -> &Destination {
        &self.destination
    }

    #[must_use]
    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[must_use]
    pub const fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    #[must_use]
    pub const fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    #[must_use]
    pub const fn context(&self) -> &Arc<BrokerContext> {
        &self.context
    }

    #[must_use]
    pub const fn interceptor(&self) -> &Arc<dyn DeliveryInterceptor> {
        &self.interceptor
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_dispatcher_active(&self) -> bool {
        self.dispatcher_active.load(Ordering::Acquire)
    }

    /// Whether a drain worker currently holds the lease.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Schedule a drain worker if there is work and nobody is draining.
    ///
    /// Never blocks. Returns whether a worker was scheduled.
    pub fn activate(&self) -> bool {
        if self.is_shutdown() || !self.is_dispatcher_active() {
            return false;
        }

        if self.queue.is_shutdown() || self.queue.is_empty() {
            return false;
        }

        // A DEAD destination only ever schedules the give-up worker
        if !self.connection.is_dead() && !self.interceptor.do_activate(self) {
            return false;
        }

        self.schedule_worker()
    }

    /// Run one drain cycle on the calling task.
    ///
    /// Returns [`CycleEnd::Busy`] without doing anything if a worker is
    /// already draining this destination.
    pub async fn drain_cycle(&self) -> CycleEnd {
        if !self.try_lease() {
            return CycleEnd::Busy;
        }

        let end = self.run_cycle().await;
        self.release_lease();
        end
    }

    /// Enqueue an entry for delivery.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Route`] for a malformed route, [`DeliveryError::Queue`]
    /// if the queue refuses the entry. A full queue also escalates the entry.
    pub fn publish(&self, entry: QueueEntry) -> Result<(), DeliveryError> {
        if self.is_shutdown() {
            return Err(DeliveryError::Shutdown(self.destination.clone()));
        }

        courier_cluster::validate(entry.route())?;

        match self.queue.put(entry.clone()) {
            Ok(()) => Ok(()),
            Err(e) if e.is_full() => {
                internal!(level = WARN, "Unable to queue {entry} for {}: {e}", self.destination);
                self.escalate(vec![entry], EscalationCause::QueueFull(e.clone()));
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send caller supplied entries right away, bypassing the queue.
    ///
    /// The interceptor still decides the final batch. Returns one outcome per
    /// entry that was sent; entries that already passed this node are skipped.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Transport`] if the send failed; the failure counts
    /// against the connection like any other.
    #[tracing::instrument(level = "trace", skip_all, fields(destination = %self.destination))]
    pub async fn push(&self, entries: Vec<QueueEntry>) -> Result<Vec<Outcome>, DeliveryError> {
        if self.is_shutdown() {
            return Err(DeliveryError::Shutdown(self.destination.clone()));
        }
        if self.connection.is_dead() {
            return Err(DeliveryError::Transport(crate::TransportError::Unreachable(format!(
                "{} is DEAD",
                self.destination
            ))));
        }

        let batch = self.interceptor.handle_next_messages(self, Some(entries))?;
        let mut outgoing = Vec::with_capacity(batch.len());
        for mut entry in batch {
            if self.stamp(&mut entry)? {
                outgoing.push(entry);
            }
        }

        if outgoing.is_empty() {
            return Ok(Vec::new());
        }

        outgoing!(level = DEBUG, "Pushing {} entries to {}", outgoing.len(), self.destination);

        match self.transport.send(&self.destination, &outgoing).await {
            Ok(outcomes) => {
                self.stats
                    .add_sent(outcomes.iter().filter(|outcome| outcome.is_ack()).count());
                self.stats
                    .add_rejected(outcomes.iter().filter(|outcome| !outcome.is_ack()).count());
                if let Some(transition) = self.connection.record_success() {
                    self.on_transition(&transition);
                }
                self.interceptor.post_handle_next_messages(self, &outgoing);
                Ok(outcomes)
            }
            Err(e) => {
                if e.is_transient() {
                    self.record_failure(&e.to_string());
                }
                Err(e.into())
            }
        }
    }

    /// Pause or resume delivery without touching the connection state.
    pub fn set_dispatcher_active(&self, active: bool) {
        let was = self.dispatcher_active.swap(active, Ordering::AcqRel);
        if was != active {
            internal!(
                level = INFO,
                "Dispatcher of {} {}",
                self.destination,
                if active { "resumed" } else { "paused" }
            );
        }

        if active {
            self.activate();
        }
    }

    /// Probe a POLLING destination now instead of waiting for the reconnect
    /// timer. Returns the resulting state.
    pub async fn retry_now(&self) -> crate::ConnectionStateEnum {
        if self.connection.is_polling() && !self.is_shutdown() {
            self.cancel_reconnect();
            self.probe().await;
        }

        self.connection.state()
    }

    /// The next batch from the queue for interceptors that do not reorder:
    /// the leading run of highest priority entries, bounded by the burst
    /// limits, with expired and filtered entries removed.
    ///
    /// # Errors
    ///
    /// Queue failures.
    pub fn next_prepared_batch(&self) -> Result<Vec<QueueEntry>, DeliveryError> {
        let limit = self.config.burst_limit();

        loop {
            let peeked = self.queue.peek_same_priority(limit)?;
            if peeked.is_empty() {
                return Ok(peeked);
            }

            // Everything not returned was removed, so this terminates
            let prepared = self.prepare_entries(peeked)?;
            if !prepared.is_empty() {
                return Ok(prepared);
            }
        }
    }

    /// Drop expired entries and entries the access filter does not match.
    ///
    /// Both are removed from the queue. Entries the filter fails on are
    /// removed and escalated.
    ///
    /// # Errors
    ///
    /// Queue failures while removing.
    pub fn prepare_entries(&self, entries: Vec<QueueEntry>) -> Result<Vec<QueueEntry>, DeliveryError> {
        let now = SystemTime::now();
        let mut ready = Vec::with_capacity(entries.len());
        let mut expired = Vec::new();
        let mut filtered = Vec::new();
        let mut failed = Vec::new();

        for entry in entries {
            if entry.is_expired_at(now) {
                expired.push(entry.id());
                continue;
            }

            if let Some(binding) = &self.filter {
                match binding.matches(self.context.queries(), &entry) {
                    Ok(true) => {}
                    Ok(false) => {
                        filtered.push(entry.id());
                        continue;
                    }
                    Err(e) => {
                        failed.push((entry, e));
                        continue;
                    }
                }
            }

            ready.push(entry);
        }

        if expired.is_empty() && filtered.is_empty() && failed.is_empty() {
            return Ok(ready);
        }

        let mut discard: Vec<EntryId> = Vec::with_capacity(expired.len() + filtered.len() + failed.len());
        discard.extend(&expired);
        discard.extend(&filtered);
        discard.extend(failed.iter().map(|(entry, _)| entry.id()));
        self.queue.remove(&discard)?;

        if !expired.is_empty() {
            internal!(level = DEBUG, "Dropped {} expired entries for {}", expired.len(), self.destination);
            self.stats.add_expired(expired.len());
        }
        self.stats.add_filtered(filtered.len());

        for (entry, e) in failed {
            self.escalate(vec![entry], EscalationCause::Filter(e.to_string()));
        }

        Ok(ready)
    }

    /// Hand `entries` to the error handler.
    pub fn escalate(&self, entries: Vec<QueueEntry>, cause: EscalationCause) {
        if entries.is_empty() {
            return;
        }

        self.stats.add_escalated(entries.len());
        let queue = Arc::downgrade(&self.queue);
        self.error_handler.handle_error(MsgErrorInfo::new(
            self.destination.clone(),
            entries,
            Some(queue),
            Some(cause),
        ));
    }

    /// Stop dispatching.
    ///
    /// Waits for the in-flight batch up to the configured shutdown timeout,
    /// then deregisters from the interceptor and the broker. Queued entries
    /// stay in the queue.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        internal!("Shutting down delivery to {}", self.destination);
        self.cancel_timers();

        let timeout = self.config.shutdown_timeout();
        let idle = async {
            loop {
                let notified = self.idle.notified();
                if !self.is_draining() {
                    break;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(timeout, idle).await.is_err() {
            internal!(
                level = WARN,
                "Shutdown timeout exceeded for {}, an in-flight batch is still running",
                self.destination
            );
        } else {
            internal!(level = DEBUG, "No in-flight batch left for {}", self.destination);
        }

        self.interceptor.shutdown_manager(self);
        self.error_handler.shutdown();
        self.context.deregister_manager(&self.destination, &self.this);

        internal!(
            level = INFO,
            "Delivery to {} shut down with {} entries left in {}",
            self.destination,
            self.queue.len(),
            self.queue.name()
        );
    }

    fn try_lease(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release_lease(&self) {
        self.draining.store(false, Ordering::Release);
        self.idle.notify_waiters();
    }

    fn schedule_worker(&self) -> bool {
        if self.context.pool().is_closed() {
            internal!(level = DEBUG, "Worker pool closed, not draining {}", self.destination);
            return false;
        }

        if !self.try_lease() {
            return false;
        }

        let Some(manager) = self.this.upgrade() else {
            self.release_lease();
            return false;
        };

        let lease = WorkerLease(manager);
        let collect_time = self.config.collect_time();
        self.context.pool().spawn(async move {
            if !collect_time.is_zero() {
                tokio::time::sleep(collect_time).await;
            }
            lease.run().await;
        });

        true
    }
}

/// The drain lease of a scheduled worker. Dropping it releases the lease,
/// also when the pool drops the worker before it ran.
struct WorkerLease(Arc<DeliveryManager>);

impl WorkerLease {
    async fn run(self) {
        let manager = Arc::clone(&self.0);
        let end = manager.run_cycle().await;
        drop(self);

        internal!(level = TRACE, "Drain worker for {} ended: {end:?}", manager.destination);

        // Entries that arrived while the lease was held, or the give-up that
        // follows a DEAD transition
        if end.should_reactivate() {
            manager.activate();
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.0.release_lease();
    }
}

impl courier_queue::PutListener for DeliveryManager {
    fn on_put(&self, _queue: &str, _entry: &QueueEntry) {
        self.activate();
    }
}

impl fmt::Debug for DeliveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryManager")
            .field("destination", &self.destination)
            .field("state", &self.connection.state())
            .field("queue", &self.queue.name())
            .field("queued", &self.queue.len())
            .field("draining", &self.is_draining())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}
