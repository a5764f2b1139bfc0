use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters of one destination.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    sent: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    escalated: AtomicU64,
    expired: AtomicU64,
    filtered: AtomicU64,
    looped: AtomicU64,
    cycles: AtomicU64,
}

/// Point-in-time copy of [`DeliveryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Entries acknowledged by the transport.
    pub sent: u64,
    /// Entries refused by the destination.
    pub rejected: u64,
    /// Transient send or ping failures.
    pub failed: u64,
    /// Entries handed to the error handler.
    pub escalated: u64,
    /// Entries dropped because their expiry passed.
    pub expired: u64,
    /// Entries dropped by the access filter.
    pub filtered: u64,
    /// Entries kept local because their route already passed this node.
    pub looped: u64,
    /// Completed drain cycles.
    pub cycles: u64,
}

macro_rules! counters {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self, n: usize) {
                self.$field.fetch_add(n as u64, Ordering::Relaxed);
            }
        )*
    };
}

impl DeliveryStats {
    counters! {
        add_sent => sent,
        add_rejected => rejected,
        add_failed => failed,
        add_escalated => escalated,
        add_expired => expired,
        add_filtered => filtered,
        add_looped => looped,
        add_cycles => cycles,
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            looped: self.looped.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = DeliveryStats::default();
        stats.add_sent(3);
        stats.add_sent(2);
        stats.add_expired(1);
        stats.add_cycles(1);

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                sent: 5,
                expired: 1,
                cycles: 1,
                ..StatsSnapshot::default()
            }
        );
    }
}
