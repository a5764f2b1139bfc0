use std::time::Duration;

use courier_common::internal;
use tokio::task::JoinHandle;

use super::DeliveryManager;
use crate::{ConnectionStateEnum, Transition};

/// Background tasks of one destination.
#[derive(Debug, Default)]
pub(super) struct Timers {
    reconnect: Option<JoinHandle<()>>,
    ping: Option<JoinHandle<()>>,
}

fn is_pending(handle: Option<&JoinHandle<()>>) -> bool {
    handle.is_some_and(|handle| !handle.is_finished())
}

impl DeliveryManager {
    /// Initial connect at registration. A failure counts against the retry
    /// budget and leaves the destination POLLING.
    pub(super) async fn connect(&self) {
        match self.transport.ping(&self.destination).await {
            Ok(()) => self.start_ping(),
            Err(e) => {
                internal!(level = WARN, "Initial connect to {} failed: {e}", self.destination);
                self.record_failure(&e.to_string());
            }
        }
    }

    /// Count a transport failure and react to the resulting transition.
    pub(super) fn record_failure(&self, error: &str) -> Option<Transition> {
        self.stats.add_failed(1);
        let transition = self.connection.record_failure(error)?;
        self.on_transition(&transition);
        Some(transition)
    }

    /// Run interceptor hooks and start or stop timers for a transition.
    ///
    /// POLLING to POLLING is not a change for the hooks, but still re-arms
    /// the reconnect timer.
    pub(super) fn on_transition(&self, transition: &Transition) {
        if transition.is_change() {
            match transition.new {
                ConnectionStateEnum::Alive => self.interceptor.to_alive(self),
                ConnectionStateEnum::Polling => self.interceptor.to_polling(self),
                ConnectionStateEnum::Dead => self
                    .interceptor
                    .to_dead(self, transition.error.as_deref()),
            }
        }

        match transition.new {
            ConnectionStateEnum::Alive => {
                self.cancel_reconnect();
                self.start_ping();
                self.activate();
            }
            ConnectionStateEnum::Polling => {
                self.cancel_ping();
                self.arm_reconnect(transition.retry_counter);
            }
            ConnectionStateEnum::Dead => {
                self.cancel_timers();
                // Schedules the give-up worker unless a worker is running; a
                // running worker re-activates once it ends
                self.activate();
            }
        }
    }

    /// Delay before the reconnect attempt following `retry_counter`
    /// consecutive failures, or `None` if reconnecting is disabled.
    fn reconnect_delay(&self, retry_counter: u32) -> Option<Duration> {
        let delay = self.config.delay()?;
        if retry_counter <= 1 {
            return Some(self.config.instant_retry());
        }

        Some(self.config.backoff.delay_for(delay, retry_counter - 1))
    }

    fn arm_reconnect(&self, retry_counter: u32) {
        if self.is_shutdown() {
            return;
        }

        let Some(wait) = self.reconnect_delay(retry_counter) else {
            internal!(
                level = DEBUG,
                "Automatic reconnect to {} disabled, waiting for a manual retry",
                self.destination
            );
            return;
        };

        let mut timers = self.timers.lock();
        if is_pending(timers.reconnect.as_ref()) {
            return;
        }

        internal!(
            level = DEBUG,
            "Reconnecting to {} in {}ms (attempt {})",
            self.destination,
            wait.as_millis(),
            retry_counter
        );

        let manager = self.this.clone();
        timers.reconnect = Some(self.context.pool().handle().spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(manager) = manager.upgrade() {
                manager.probe().await;
            }
        }));
    }

    /// One reconnect attempt of a POLLING destination.
    pub(super) async fn probe(&self) {
        // Detach our own handle so a failed attempt can arm the next one
        drop(self.timers.lock().reconnect.take());

        if self.is_shutdown() || !self.connection.is_polling() {
            return;
        }

        match self.transport.ping(&self.destination).await {
            Ok(()) => {
                internal!(level = INFO, "Reconnected to {}", self.destination);
                if let Some(transition) = self.connection.record_success() {
                    self.on_transition(&transition);
                }
            }
            Err(e) => {
                internal!(level = DEBUG, "Reconnect to {} failed: {e}", self.destination);
                self.record_failure(&e.to_string());
            }
        }
    }

    fn start_ping(&self) {
        let Some(interval) = self.config.ping_interval() else {
            return;
        };

        if self.is_shutdown() {
            return;
        }

        let mut timers = self.timers.lock();
        if is_pending(timers.ping.as_ref()) {
            return;
        }

        let manager = self.this.clone();
        timers.ping = Some(self.context.pool().handle().spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(manager) = manager.upgrade() else {
                    break;
                };

                if manager.is_shutdown() || !manager.connection.is_alive() {
                    break;
                }

                if let Err(e) = manager.transport.ping(&manager.destination).await {
                    internal!(level = WARN, "Ping of {} failed: {e}", manager.destination);
                    manager.record_failure(&e.to_string());
                    break;
                }
            }
        }));
    }

    pub(super) fn cancel_reconnect(&self) {
        if let Some(handle) = self.timers.lock().reconnect.take() {
            handle.abort();
        }
    }

    fn cancel_ping(&self) {
        if let Some(handle) = self.timers.lock().ping.take() {
            handle.abort();
        }
    }

    pub(super) fn cancel_timers(&self) {
        self.cancel_reconnect();
        self.cancel_ping();
    }
}
