use async_trait::async_trait;
use courier_common::Destination;
use courier_queue::QueueEntry;

use crate::TransportError;

/// Per-entry result of a [`Transport::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Delivered, remove from the queue.
    Ack,
    /// Refused by the destination, will never succeed.
    Rejected(String),
}

impl Outcome {
    #[must_use]
    pub const fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }
}

/// Wire-level delivery to a destination.
///
/// Implementations own connection handling, framing and timeouts. A timeout is
/// reported as [`TransportError::Timeout`] and treated like any other transient
/// failure. Sends are never cancelled by the caller once started.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `batch` in order.
    ///
    /// On success there is exactly one [`Outcome`] per entry, in batch order.
    ///
    /// # Errors
    ///
    /// A transient [`TransportError`] if the destination could not be reached,
    /// or [`TransportError::Rejected`] if it refused the whole batch.
    async fn send(
        &self,
        destination: &Destination,
        batch: &[QueueEntry],
    ) -> Result<Vec<Outcome>, TransportError>;

    /// Check reachability without sending anything. Used for the initial
    /// connect, periodic pings and reconnect attempts.
    ///
    /// # Errors
    ///
    /// A transient [`TransportError`] if the destination is unreachable.
    async fn ping(&self, _destination: &Destination) -> Result<(), TransportError> {
        Ok(())
    }
}
