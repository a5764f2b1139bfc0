use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use courier_cluster::RouteRegistry;
use courier_common::{Destination, Signal, incoming, internal, tracing};
use courier_delivery::{BrokerContext, DeliveryManager, WorkerPool};
use courier_queue::{MemoryQueue, Queue};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    sync::broadcast,
};

use crate::{
    config::CourierConfig,
    ingress::Command,
    transport::LogTransport,
};

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn wait_for_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    Ok(())
}

async fn shutdown() -> anyhow::Result<()> {
    let result = wait_for_signal().await;

    if SHUTDOWN_BROADCAST.send(Signal::Shutdown).is_err() {
        tracing::debug!("Nothing was listening for the shutdown signal");
    }

    result
}

/// The broker: every configured destination served by a log sink, fed from
/// operator input.
pub struct Courier {
    context: Arc<BrokerContext>,
    transport: Arc<LogTransport>,
    managers: Vec<Arc<DeliveryManager>>,
    stats_interval: Option<Duration>,
}

impl Courier {
    /// Build the broker context and register every configured destination.
    ///
    /// # Errors
    ///
    /// If called outside a runtime, or if a destination fails to register.
    pub async fn start(config: CourierConfig) -> anyhow::Result<Self> {
        let pool = WorkerPool::new(config.workers)?;
        let dead_letters = Arc::new(MemoryQueue::with_config("dead-letter", config.dead_letter));
        let context = Arc::new(
            BrokerContext::new(RouteRegistry::new(&config.cluster), pool, &config.plugins)
                .with_dead_letters(dead_letters),
        );

        let transport = Arc::new(LogTransport::default());
        let mut managers = Vec::with_capacity(config.destinations.len());

        for destination in config.destinations {
            let name = destination.name.trim();
            let manager = DeliveryManager::builder(Destination::new(name), transport.clone())
                .config(destination.dispatch)
                .queue(Arc::new(MemoryQueue::with_config(name, destination.queue)))
                .register(&context)
                .await
                .map_err(|e| anyhow::anyhow!("Unable to register destination {name}: {e}"))?;
            managers.push(manager);
        }

        internal!(
            level = INFO,
            "Serving {} destination(s) as node {}",
            managers.len(),
            context.routes().node_id()
        );

        Ok(Self {
            context,
            transport,
            managers,
            stats_interval: (config.stats_interval_secs > 0)
                .then(|| Duration::from_secs(config.stats_interval_secs)),
        })
    }

    pub const fn context(&self) -> &Arc<BrokerContext> {
        &self.context
    }

    pub const fn transport(&self) -> &Arc<LogTransport> {
        &self.transport
    }

    fn manager(&self, destination: &Destination) -> anyhow::Result<&Arc<DeliveryManager>> {
        self.managers
            .iter()
            .find(|manager| manager.destination() == destination)
            .ok_or_else(|| anyhow::anyhow!("Unknown destination {destination}"))
    }

    /// Carry out one operator command and describe the result.
    ///
    /// # Errors
    ///
    /// Unknown destinations, and whatever publishing returns.
    pub async fn execute(&self, command: Command) -> anyhow::Result<String> {
        match &command {
            Command::Publish { destination, .. } => {
                let manager = self.manager(destination)?;
                let entry = command
                    .entry()
                    .ok_or_else(|| anyhow::anyhow!("Nothing to publish"))?;
                let id = entry.id();
                manager.publish(entry)?;
                Ok(format!("Queued {id} for {destination}"))
            }
            Command::Pause(destination) => {
                self.manager(destination)?.set_dispatcher_active(false);
                Ok(format!("Paused {destination}"))
            }
            Command::Resume(destination) => {
                self.manager(destination)?.set_dispatcher_active(true);
                Ok(format!("Resumed {destination}"))
            }
            Command::Retry(destination) => {
                let state = self.manager(destination)?.retry_now().await;
                Ok(format!("{destination} is {state}"))
            }
            Command::Stats => Ok(self.report().join("\n")),
        }
    }

    /// Parse and execute one input line.
    ///
    /// # Errors
    ///
    /// Malformed lines and failed commands.
    pub async fn handle_line(&self, line: &str) -> anyhow::Result<String> {
        let command: Command = line.parse()?;
        self.execute(command).await
    }

    /// One line per destination with its state and counters, then the
    /// dead-letter backlog.
    pub fn report(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .managers
            .iter()
            .map(|manager| {
                let stats = manager.stats();
                format!(
                    "{}: {} queued={} sent={} rejected={} failed={} escalated={} expired={} filtered={} looped={}",
                    manager.destination(),
                    manager.connection().state(),
                    manager.queue().len(),
                    stats.sent,
                    stats.rejected,
                    stats.failed,
                    stats.escalated,
                    stats.expired,
                    stats.filtered,
                    stats.looped,
                )
            })
            .collect();

        lines.push(format!("dead-letter: {}", self.context.dead_letters().len()));
        lines
    }

    /// Read operator lines until shutdown. Closing the input does not stop
    /// the broker.
    ///
    /// # Errors
    ///
    /// If reading the input fails.
    pub async fn serve_ingress<R>(
        &self,
        reader: R,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut open = true;

        loop {
            tokio::select! {
                line = lines.next_line(), if open => match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match self.handle_line(&line).await {
                        Ok(reply) => incoming!(level = INFO, "{reply}"),
                        Err(e) => internal!(level = WARN, "{e}"),
                    },
                    None => {
                        internal!(level = DEBUG, "Input closed, waiting for shutdown");
                        open = false;
                    }
                },
                sig = shutdown.recv() => {
                    match sig {
                        Ok(s) => tracing::debug!("Ingress received {s:?}"),
                        Err(e) => tracing::debug!("Ingress shutdown channel: {e:?}"),
                    }
                    break;
                }
            }
        }

        Ok(())
    }

    /// Log [`Courier::report`] periodically until shutdown.
    pub async fn serve_stats(&self, mut shutdown: broadcast::Receiver<Signal>) {
        let Some(interval) = self.stats_interval else {
            let _ = shutdown.recv().await;
            return;
        };

        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for line in self.report() {
                        internal!(level = INFO, "{line}");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Run until CTRL+C or SIGTERM, then shut every destination down.
    ///
    /// # Errors
    ///
    /// If the signal handlers cannot be installed or reading stdin fails.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        internal!(level = INFO, "Controller running");

        let stdin = BufReader::new(tokio::io::stdin());
        let (ingress, (), signal) = tokio::join!(
            self.serve_ingress(stdin, SHUTDOWN_BROADCAST.subscribe()),
            self.serve_stats(SHUTDOWN_BROADCAST.subscribe()),
            shutdown(),
        );

        internal!(level = INFO, "Shutting down...");
        for line in self.report() {
            internal!(level = INFO, "{line}");
        }
        self.context.shutdown().await;

        ingress.and(signal)
    }
}
