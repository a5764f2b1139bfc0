use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use courier_common::{Destination, outgoing};
use courier_delivery::{Outcome, Transport, TransportError};
use courier_queue::QueueEntry;

/// Transport that writes every delivery to the log.
///
/// Useful as a sink while wiring up a broker, and for watching how the
/// dispatch core orders, batches and escalates entries. It can be taken
/// offline to exercise the reconnect path.
#[derive(Debug)]
pub struct LogTransport {
    online: AtomicBool,
}

impl Default for LogTransport {
    fn default() -> Self {
        Self {
            online: AtomicBool::new(true),
        }
    }
}

impl LogTransport {
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn check(&self, destination: &Destination) -> Result<(), TransportError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(TransportError::Unreachable(format!("{destination} is offline")))
        }
    }
}

#[async_trait]
impl Transport for LogTransport {
    async fn send(
        &self,
        destination: &Destination,
        batch: &[QueueEntry],
    ) -> Result<Vec<Outcome>, TransportError> {
        self.check(destination)?;

        for entry in batch {
            outgoing!(
                level = INFO,
                "[{destination}] {entry} ({} hops): {}",
                entry.route().len(),
                String::from_utf8_lossy(entry.payload())
            );
        }

        Ok(vec![Outcome::Ack; batch.len()])
    }

    async fn ping(&self, destination: &Destination) -> Result<(), TransportError> {
        self.check(destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acknowledges_every_entry() {
        let transport = LogTransport::default();
        let destination = Destination::new("callback:joe");
        let batch = [
            QueueEntry::new(b"one".as_slice()),
            QueueEntry::new(b"two".as_slice()),
        ];

        let outcomes = transport.send(&destination, &batch).await.unwrap();
        assert_eq!(outcomes, vec![Outcome::Ack, Outcome::Ack]);
        assert!(transport.ping(&destination).await.is_ok());
    }

    #[tokio::test]
    async fn test_offline() {
        let transport = LogTransport::default();
        let destination = Destination::new("callback:joe");
        transport.set_online(false);

        let err = transport.ping(&destination).await.unwrap_err();
        assert!(err.is_transient());
        assert!(
            transport
                .send(&destination, &[QueueEntry::new(b"lost".as_slice())])
                .await
                .is_err()
        );
    }
}
