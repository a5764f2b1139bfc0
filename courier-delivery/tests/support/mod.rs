#![allow(dead_code)] // Shared by several test binaries

pub mod mock_transport;

use std::{sync::Arc, time::Duration};

use courier_cluster::{NodeId, RouteRegistry};
use courier_delivery::{
    BrokerContext, DispatchConfig, ErrorHandler, MsgErrorInfo, PluginsConfig, WorkerPool,
    WorkerPoolConfig,
};
use parking_lot::Mutex;

/// Collects escalations instead of handling them.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    pub escalated: Mutex<Vec<MsgErrorInfo>>,
}

impl RecordingHandler {
    pub fn count(&self) -> usize {
        self.escalated.lock().iter().map(|info| info.entries().len()).sum()
    }

    pub fn reports(&self) -> usize {
        self.escalated.lock().len()
    }
}

impl ErrorHandler for RecordingHandler {
    fn handle_error(&self, info: MsgErrorInfo) {
        self.escalated.lock().push(info);
    }
}

pub fn context(node: &str) -> Arc<BrokerContext> {
    context_with(node, &PluginsConfig::default())
}

pub fn context_with(node: &str, plugins: &PluginsConfig) -> Arc<BrokerContext> {
    let pool = WorkerPool::new(WorkerPoolConfig { max_workers: 8 }).expect("inside a runtime");
    Arc::new(BrokerContext::new(
        RouteRegistry::standalone(NodeId::new(node)),
        pool,
        plugins,
    ))
}

/// Timers off, so tests drive every reconnect themselves.
pub fn manual_config() -> DispatchConfig {
    DispatchConfig {
        delay_ms: 0,
        ping_interval_ms: 0,
        ..DispatchConfig::default()
    }
}

/// Poll `condition` until it holds or two seconds passed.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
