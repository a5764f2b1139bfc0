use courier_cluster::Stamp;
use courier_common::{internal, outgoing};
use courier_queue::{EntryId, QueueEntry};

use super::DeliveryManager;
use crate::{ConnectionStateEnum, DeliveryError, EscalationCause, Outcome, Transition, TransportError};

/// Why a drain cycle stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEnd {
    /// The interceptor had nothing more to send.
    Drained,
    /// A transient failure left the destination POLLING.
    Polling,
    /// A failure used up the retry budget.
    Dead,
    /// The destination was DEAD and everything queued was escalated.
    GaveUp,
    Shutdown,
    /// The dispatcher is paused.
    Inactive,
    /// Another worker holds the lease.
    Busy,
    /// The interceptor or the queue failed.
    Error,
}

impl CycleEnd {
    /// Whether the pool worker should try to activate again after this end.
    pub(super) const fn should_reactivate(self) -> bool {
        matches!(self, Self::Drained | Self::GaveUp | Self::Dead)
    }
}

enum BatchEnd {
    Continue,
    Polling,
    Dead,
}

impl DeliveryManager {
    /// Drain batches until there is nothing left or delivery has to stop.
    /// The caller holds the lease.
    #[tracing::instrument(level = "trace", skip_all, fields(destination = %self.destination))]
    pub(super) async fn run_cycle(&self) -> CycleEnd {
        self.stats.add_cycles(1);

        loop {
            if self.is_shutdown() {
                return CycleEnd::Shutdown;
            }

            if !self.is_dispatcher_active() {
                return CycleEnd::Inactive;
            }

            if self.connection.is_dead() {
                return self.give_up();
            }

            let batch = match self.interceptor.handle_next_messages(self, None) {
                Ok(batch) => batch,
                Err(e) => {
                    internal!(
                        level = ERROR,
                        "Interceptor {} failed for {}: {e}",
                        self.config.interceptor_key(),
                        self.destination
                    );
                    self.interceptor.on_worker_error(self, &e);
                    return CycleEnd::Error;
                }
            };

            if batch.is_empty() {
                return CycleEnd::Drained;
            }

            match self.deliver(batch).await {
                BatchEnd::Continue => {}
                BatchEnd::Polling => return CycleEnd::Polling,
                BatchEnd::Dead => return CycleEnd::Dead,
            }
        }
    }

    /// Append the local hop to a clone of the queued entry.
    ///
    /// Returns `false` for entries that already passed this node; they are
    /// kept local and never forwarded again.
    pub(super) fn stamp(&self, entry: &mut QueueEntry) -> Result<bool, DeliveryError> {
        let topic = entry.topic().map(ToOwned::to_owned);
        match self.context.routes().stamp(entry.route_mut(), topic.as_deref())? {
            Stamp::Appended(_) => Ok(true),
            Stamp::Loop { .. } => {
                self.stats.add_looped(1);
                Ok(false)
            }
        }
    }

    async fn deliver(&self, batch: Vec<QueueEntry>) -> BatchEnd {
        let mut outgoing = Vec::with_capacity(batch.len());
        let mut settled: Vec<EntryId> = Vec::new();

        for mut entry in batch {
            match self.stamp(&mut entry) {
                Ok(true) => outgoing.push(entry),
                Ok(false) => settled.push(entry.id()),
                Err(e) => {
                    settled.push(entry.id());
                    let cause = match e {
                        DeliveryError::Route(route) => EscalationCause::IllegalRoute(route),
                        other => EscalationCause::Internal(other.to_string()),
                    };
                    self.escalate(vec![entry], cause);
                }
            }
        }

        if !settled.is_empty()
            && let Err(e) = self.queue.remove(&settled)
        {
            internal!(level = ERROR, "Unable to remove settled entries from {}: {e}", self.queue.name());
        }

        if outgoing.is_empty() {
            return BatchEnd::Continue;
        }

        outgoing!(
            level = DEBUG,
            "Sending {} entries ({} bytes) to {}",
            outgoing.len(),
            outgoing.iter().map(QueueEntry::size).sum::<usize>(),
            self.destination
        );

        let result = match self.transport.send(&self.destination, &outgoing).await {
            Ok(outcomes) if outcomes.len() != outgoing.len() => Err(TransportError::OutcomeMismatch {
                expected: outgoing.len(),
                actual: outcomes.len(),
            }),
            other => other,
        };

        match result {
            Ok(outcomes) => {
                self.settle(outgoing, outcomes);
                BatchEnd::Continue
            }
            Err(TransportError::Rejected(reason)) => {
                internal!(
                    level = WARN,
                    "{} rejected a batch of {}: {reason}",
                    self.destination,
                    outgoing.len()
                );
                self.remove_in_order(&outgoing);
                self.stats.add_rejected(outgoing.len());
                self.escalate(outgoing, EscalationCause::Rejected(reason));
                BatchEnd::Continue
            }
            Err(e) => match self.record_failure(&e.to_string()) {
                Some(Transition {
                    new: ConnectionStateEnum::Dead,
                    ..
                })
                | None => BatchEnd::Dead,
                Some(_) => BatchEnd::Polling,
            },
        }
    }

    /// Remove a delivered batch and escalate the entries the destination
    /// refused.
    fn settle(&self, outgoing: Vec<QueueEntry>, outcomes: Vec<Outcome>) {
        self.remove_in_order(&outgoing);

        let mut delivered = Vec::with_capacity(outgoing.len());
        let mut rejected = Vec::new();
        for (entry, outcome) in outgoing.into_iter().zip(outcomes) {
            match outcome {
                Outcome::Ack => delivered.push(entry),
                Outcome::Rejected(reason) => rejected.push((entry, reason)),
            }
        }

        self.stats.add_sent(delivered.len());
        self.stats.add_rejected(rejected.len());

        if let Some(transition) = self.connection.record_success() {
            self.on_transition(&transition);
        }

        self.interceptor.post_handle_next_messages(self, &delivered);

        for (entry, reason) in rejected {
            internal!(level = WARN, "{} rejected {entry}: {reason}", self.destination);
            self.escalate(vec![entry], EscalationCause::Rejected(reason));
        }
    }

    /// Remove `entries` from the queue in the order they were sent.
    fn remove_in_order(&self, entries: &[QueueEntry]) {
        let ids: Vec<EntryId> = entries.iter().map(QueueEntry::id).collect();
        match self.queue.remove(&ids) {
            Ok(removed) if removed != ids.len() => internal!(
                level = WARN,
                "Expected to remove {} entries from {}, removed {removed}",
                ids.len(),
                self.queue.name()
            ),
            Ok(_) => {}
            Err(e) => internal!(
                level = ERROR,
                "Unable to remove delivered entries from {}: {e}",
                self.queue.name()
            ),
        }
    }

    /// Escalate everything queued for a DEAD destination, batch by batch.
    ///
    /// The interceptor still shapes each batch: its destroy rules apply and
    /// expired or filtered entries are dropped before anything is escalated.
    fn give_up(&self) -> CycleEnd {
        let cause = EscalationCause::RetryExhausted {
            retries: self.connection.retry_counter(),
            last_error: self
                .connection
                .last_error()
                .unwrap_or_else(|| "reason is not known".to_string()),
        };
        let mut escalated = 0;

        while !self.is_shutdown() {
            let batch = match self.interceptor.handle_next_messages(self, None) {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => batch,
                Err(e) => {
                    internal!(
                        level = ERROR,
                        "Interceptor {} failed while giving up on {}: {e}",
                        self.config.interceptor_key(),
                        self.destination
                    );
                    self.interceptor.on_worker_error(self, &e);
                    return CycleEnd::Error;
                }
            };

            let ids: Vec<EntryId> = batch.iter().map(QueueEntry::id).collect();
            match self.queue.remove(&ids) {
                Ok(0) => {
                    internal!(
                        level = ERROR,
                        "Interceptor {} offered {} entries that are not in {}",
                        self.config.interceptor_key(),
                        ids.len(),
                        self.queue.name()
                    );
                    return CycleEnd::Error;
                }
                Ok(_) => {}
                Err(e) => {
                    internal!(level = ERROR, "Unable to remove from {} while giving up: {e}", self.queue.name());
                    return CycleEnd::Error;
                }
            }

            escalated += batch.len();
            self.escalate(batch, cause.clone());
        }

        if escalated > 0 {
            internal!(
                level = WARN,
                "{} is DEAD, escalated {escalated} entries: {cause}",
                self.destination
            );
        }

        CycleEnd::GaveUp
    }
}
