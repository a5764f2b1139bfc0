//! Scriptable transport for delivery scenarios
//!
//! The transport can:
//! - Answer sends from a script of outcomes, acknowledging everything once the
//!   script runs out
//! - Be switched unreachable, failing sends and pings
//! - Delay sends to widen race windows
//! - Record every delivered entry and the peak number of concurrent sends
//!
//! # Example
//!
//! ```rust,ignore
//! let transport = MockTransport::builder()
//!     .unreachable()
//!     .with_send_delay(Duration::from_millis(5))
//!     .build();
//!
//! transport.set_reachable(true);
//! assert!(transport.wait_for_sent(3, Duration::from_secs(1)).await);
//! ```
#![allow(dead_code)] // Not every scenario uses every helper

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_common::Destination;
use courier_delivery::{Outcome, Transport, TransportError};
use courier_queue::QueueEntry;
use parking_lot::Mutex;

/// Scripted answer to one `send`.
#[derive(Debug, Clone)]
pub enum SendStep {
    /// Acknowledge every entry.
    Ack,
    /// Fail the whole send with this error.
    Fail(TransportError),
    /// Answer with these outcomes, one per entry.
    Outcomes(Vec<Outcome>),
}

#[derive(Debug, Default)]
pub struct MockTransportBuilder {
    unreachable: bool,
    send_delay: Option<Duration>,
    script: VecDeque<SendStep>,
}

impl MockTransportBuilder {
    /// Start with sends and pings failing.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    pub fn with_step(mut self, step: SendStep) -> Self {
        self.script.push_back(step);
        self
    }

    pub fn build(self) -> Arc<MockTransport> {
        Arc::new(MockTransport {
            reachable: AtomicBool::new(!self.unreachable),
            send_delay: self.send_delay,
            script: Mutex::new(self.script),
            sent: Mutex::new(Vec::new()),
            send_calls: AtomicUsize::new(0),
            ping_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }
}

#[derive(Debug)]
pub struct MockTransport {
    reachable: AtomicBool,
    send_delay: Option<Duration>,
    script: Mutex<VecDeque<SendStep>>,
    sent: Mutex<Vec<QueueEntry>>,
    send_calls: AtomicUsize,
    ping_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn push_step(&self, step: SendStep) {
        self.script.lock().push_back(step);
    }

    /// Entries acknowledged so far, in delivery order.
    pub fn sent(&self) -> Vec<QueueEntry> {
        self.sent.lock().clone()
    }

    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.sent.lock().iter().map(|e| e.payload().to_vec()).collect()
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn ping_calls(&self) -> usize {
        self.ping_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` entries were acknowledged.
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.sent.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sent.lock().len() >= count
    }

    fn unreachable_error() -> TransportError {
        TransportError::Unreachable("connection refused".to_string())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        _destination: &Destination,
        batch: &[QueueEntry],
    ) -> Result<Vec<Outcome>, TransportError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }

        let result = if self.reachable.load(Ordering::SeqCst) {
            let step = self.script.lock().pop_front().unwrap_or(SendStep::Ack);
            match step {
                SendStep::Ack => Ok(vec![Outcome::Ack; batch.len()]),
                SendStep::Fail(e) => Err(e),
                SendStep::Outcomes(outcomes) => Ok(outcomes),
            }
        } else {
            Err(Self::unreachable_error())
        };

        if let Ok(outcomes) = &result {
            let mut sent = self.sent.lock();
            sent.extend(
                batch
                    .iter()
                    .zip(outcomes)
                    .filter(|(_, outcome)| outcome.is_ack())
                    .map(|(entry, _)| entry.clone()),
            );
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn ping(&self, _destination: &Destination) -> Result<(), TransportError> {
        self.ping_calls.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Self::unreachable_error())
        }
    }
}
