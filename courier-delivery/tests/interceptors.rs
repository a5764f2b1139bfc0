//! Interceptor plugins: the priority holdback and custom singletons

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use courier_cluster::{NodeId, RouteRegistry};
use courier_common::Destination;
use courier_delivery::{
    BrokerContext, ConnectionStateEnum, DeliveryError, DeliveryInterceptor, DeliveryManager, DispatchConfig,
    EscalationCause, InterceptorRegistry, PluginError, PluginsConfig, PriorityPolicy, PriorityRule, WorkerPool,
    WorkerPoolConfig, factory,
};
use courier_queue::{Priority, Queue, QueueEntry};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use support::{RecordingHandler, context_with, eventually, manual_config, mock_transport::MockTransport};

fn rule(from: u8, to: u8, action: &str) -> PriorityRule {
    PriorityRule {
        from,
        to,
        action: action.parse().unwrap(),
    }
}

fn priority_config(retries: i32) -> DispatchConfig {
    DispatchConfig {
        retries,
        interceptor: Some("Priority,1.0".to_string()),
        ..manual_config()
    }
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Spawns drain workers on the runtime")]
async fn test_priority_holds_back_until_alive() {
    let plugins = PluginsConfig {
        priority: PriorityPolicy {
            polling: vec![rule(0, 4, "destroy")],
            ..PriorityPolicy::default()
        },
    };
    let context = context_with("heron", &plugins);
    let transport = MockTransport::builder().unreachable().build();
    let handler = Arc::new(RecordingHandler::default());

    let manager = DeliveryManager::builder(Destination::new("mobile"), transport.clone())
        .config(priority_config(-1))
        .error_handler(handler.clone())
        .register(&context)
        .await
        .unwrap();
    assert!(manager.connection().is_polling());

    manager
        .publish(QueueEntry::new(b"chatter".as_slice()).with_priority(Priority::LOW))
        .unwrap();
    manager
        .publish(QueueEntry::new(b"alert".as_slice()).with_priority(Priority::HIGH))
        .unwrap();

    // Low priority is destroyed, high priority moves to the holdback queue
    assert!(eventually(|| manager.queue().is_empty() && !manager.is_draining()).await);
    assert_eq!(transport.send_calls(), 0);
    assert_eq!(handler.count(), 0);

    transport.set_reachable(true);
    assert_eq!(manager.retry_now().await, ConnectionStateEnum::Alive);

    assert!(transport.wait_for_sent(1, Duration::from_secs(2)).await);
    assert_eq!(transport.sent_payloads(), vec![b"alert".to_vec()]);
    assert!(eventually(|| manager.queue().is_empty()).await);
    assert_eq!(handler.count(), 0);
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Spawns drain workers on the runtime")]
async fn test_priority_destroys_while_alive() {
    let plugins = PluginsConfig {
        priority: PriorityPolicy {
            alive: vec![rule(0, 1, "destroy,notify")],
            ..PriorityPolicy::default()
        },
    };
    let context = context_with("heron", &plugins);
    let transport = MockTransport::builder().build();

    let manager = DeliveryManager::builder(Destination::new("trimmed"), transport.clone())
        .config(priority_config(-1))
        .register(&context)
        .await
        .unwrap();

    manager.set_dispatcher_active(false);
    manager
        .publish(QueueEntry::new(b"noise".as_slice()).with_priority(Priority::MIN))
        .unwrap();
    manager
        .publish(QueueEntry::new(b"signal".as_slice()).with_priority(Priority::NORM))
        .unwrap();
    manager.set_dispatcher_active(true);

    assert!(transport.wait_for_sent(1, Duration::from_secs(2)).await);
    assert!(eventually(|| manager.queue().is_empty()).await);
    assert_eq!(transport.sent_payloads(), vec![b"signal".to_vec()]);
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Spawns drain workers on the runtime")]
async fn test_held_back_entries_escalate_when_dead() {
    let context = context_with("heron", &PluginsConfig::default());
    let transport = MockTransport::builder().unreachable().build();
    let handler = Arc::new(RecordingHandler::default());

    let manager = DeliveryManager::builder(Destination::new("lost"), transport.clone())
        .config(priority_config(1))
        .error_handler(handler.clone())
        .register(&context)
        .await
        .unwrap();

    manager.publish(QueueEntry::new(b"kept".as_slice())).unwrap();
    assert!(eventually(|| manager.queue().is_empty() && !manager.is_draining()).await);

    assert_eq!(manager.retry_now().await, ConnectionStateEnum::Dead);
    assert!(eventually(|| handler.count() == 1).await);

    let escalated = handler.escalated.lock();
    assert_eq!(escalated[0].entries()[0].payload(), b"kept");
    assert!(matches!(
        escalated[0].cause(),
        EscalationCause::RetryExhausted { retries: 1, .. }
    ));
    drop(escalated);
    assert_eq!(transport.send_calls(), 0);
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Spawns drain workers on the runtime")]
async fn test_dead_rules_destroy_instead_of_escalating() {
    let plugins = PluginsConfig {
        priority: PriorityPolicy {
            dead: vec![rule(0, 9, "destroy")],
            ..PriorityPolicy::default()
        },
    };
    let context = context_with("heron", &plugins);
    let transport = MockTransport::builder().unreachable().build();
    let handler = Arc::new(RecordingHandler::default());

    let manager = DeliveryManager::builder(Destination::new("expendable"), transport.clone())
        .config(priority_config(0))
        .error_handler(handler.clone())
        .register(&context)
        .await
        .unwrap();
    assert!(manager.connection().is_dead());

    manager.publish(QueueEntry::new(b"gone".as_slice())).unwrap();

    assert!(eventually(|| manager.queue().is_empty() && !manager.is_draining()).await);
    assert_eq!(handler.count(), 0);
    assert_eq!(manager.stats().escalated, 0);
    assert_eq!(transport.send_calls(), 0);
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Spawns drain workers on the runtime")]
async fn test_dead_rules_apply_to_held_back_entries() {
    let plugins = PluginsConfig {
        priority: PriorityPolicy {
            dead: vec![rule(0, 4, "destroy"), rule(5, 9, "notify")],
            ..PriorityPolicy::default()
        },
    };
    let context = context_with("heron", &plugins);
    let transport = MockTransport::builder().unreachable().build();
    let handler = Arc::new(RecordingHandler::default());

    let manager = DeliveryManager::builder(Destination::new("mobile"), transport.clone())
        .config(priority_config(1))
        .error_handler(handler.clone())
        .register(&context)
        .await
        .unwrap();

    manager
        .publish(QueueEntry::new(b"chatter".as_slice()).with_priority(Priority::LOW))
        .unwrap();
    manager
        .publish(QueueEntry::new(b"alert".as_slice()).with_priority(Priority::HIGH))
        .unwrap();
    assert!(eventually(|| manager.queue().is_empty() && !manager.is_draining()).await);
    assert_eq!(handler.count(), 0);

    assert_eq!(manager.retry_now().await, ConnectionStateEnum::Dead);
    assert!(eventually(|| manager.queue().is_empty() && !manager.is_draining()).await);

    // Low priority is destroyed, high priority is escalated with a notification
    assert_eq!(handler.count(), 1);
    let escalated = handler.escalated.lock();
    assert_eq!(escalated[0].entries()[0].payload(), b"alert");
    drop(escalated);
    assert_eq!(transport.send_calls(), 0);
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Spawns drain workers on the runtime")]
async fn test_held_back_entries_keep_their_order() {
    let context = context_with("heron", &PluginsConfig::default());
    let transport = MockTransport::builder().unreachable().build();

    let manager = DeliveryManager::builder(Destination::new("mobile"), transport.clone())
        .config(priority_config(-1))
        .register(&context)
        .await
        .unwrap();

    manager.publish(QueueEntry::new(b"older".as_slice())).unwrap();
    assert!(eventually(|| manager.queue().is_empty() && !manager.is_draining()).await);

    manager.set_dispatcher_active(false);
    manager.publish(QueueEntry::new(b"newer".as_slice())).unwrap();

    transport.set_reachable(true);
    assert_eq!(manager.retry_now().await, ConnectionStateEnum::Alive);
    assert_eq!(manager.queue().len(), 2);

    manager.set_dispatcher_active(true);
    assert!(transport.wait_for_sent(2, Duration::from_secs(2)).await);
    assert_eq!(
        transport.sent_payloads(),
        vec![b"older".to_vec(), b"newer".to_vec()]
    );
}

/// Counts how often it is asked whether to schedule a worker.
#[derive(Default)]
struct Counting {
    asked: AtomicUsize,
}

impl DeliveryInterceptor for Counting {
    fn do_activate(&self, manager: &DeliveryManager) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        manager.connection().is_alive()
    }

    fn handle_next_messages(
        &self,
        manager: &DeliveryManager,
        push: Option<Vec<QueueEntry>>,
    ) -> Result<Vec<QueueEntry>, DeliveryError> {
        match push {
            Some(entries) => Ok(entries),
            None => manager.next_prepared_batch(),
        }
    }
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Spawns drain workers on the runtime")]
async fn test_empty_queue_never_asks_the_interceptor() {
    let counting = Arc::new(Counting::default());
    let mut registry = InterceptorRegistry::with_builtins(&PluginsConfig::default());
    let instance = counting.clone();
    registry.register(
        "Counting,1.0",
        factory(move || {
            let instance: Arc<dyn DeliveryInterceptor> = instance.clone();
            Ok(instance)
        }),
    );

    let pool = WorkerPool::new(WorkerPoolConfig { max_workers: 2 }).unwrap();
    let context = Arc::new(
        BrokerContext::new(
            RouteRegistry::standalone(NodeId::new("heron")),
            pool,
            &PluginsConfig::default(),
        )
        .with_interceptors(registry),
    );
    let transport = MockTransport::builder().build();
    let config = DispatchConfig {
        interceptor: Some("Counting,1.0".to_string()),
        ..manual_config()
    };

    let manager = DeliveryManager::builder(Destination::new("counted"), transport.clone())
        .config(config)
        .register(&context)
        .await
        .unwrap();

    assert!(!manager.activate());
    assert_eq!(counting.asked.load(Ordering::SeqCst), 0);

    manager.publish(QueueEntry::new(b"one".as_slice())).unwrap();
    assert!(transport.wait_for_sent(1, Duration::from_secs(2)).await);
    assert!(eventually(|| manager.queue().is_empty() && !manager.is_draining()).await);
    assert_eq!(counting.asked.load(Ordering::SeqCst), 1);

    // The drained queue is empty again
    assert!(!manager.activate());
    assert_eq!(counting.asked.load(Ordering::SeqCst), 1);

    context.shutdown().await;
}

/// Sends everything once ALIVE and records what it saw.
#[derive(Default)]
struct Audit {
    versions: Mutex<Vec<String>>,
    managers: AtomicUsize,
    delivered: AtomicUsize,
    released: AtomicUsize,
    shut_down: AtomicUsize,
}

impl DeliveryInterceptor for Audit {
    fn initialize(&self, version: &str) -> Result<(), PluginError> {
        self.versions.lock().push(version.to_string());
        Ok(())
    }

    fn add_delivery_manager(&self, manager: &DeliveryManager) -> Result<(), PluginError> {
        if manager.destination().as_str().starts_with("refused") {
            return Err(PluginError::Init {
                key: "Audit,2.1".to_string(),
                reason: format!("{} is not audited", manager.destination()),
            });
        }
        self.managers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn do_activate(&self, manager: &DeliveryManager) -> bool {
        manager.connection().is_alive()
    }

    fn handle_next_messages(
        &self,
        manager: &DeliveryManager,
        push: Option<Vec<QueueEntry>>,
    ) -> Result<Vec<QueueEntry>, DeliveryError> {
        match push {
            Some(entries) => Ok(entries),
            None => manager.next_prepared_batch(),
        }
    }

    fn post_handle_next_messages(&self, _manager: &DeliveryManager, delivered: &[QueueEntry]) {
        self.delivered.fetch_add(delivered.len(), Ordering::SeqCst);
    }

    fn shutdown_manager(&self, _manager: &DeliveryManager) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        self.shut_down.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Spawns drain workers on the runtime")]
async fn test_custom_interceptor_is_a_shared_singleton() {
    let audit = Arc::new(Audit::default());
    let mut registry = InterceptorRegistry::with_builtins(&PluginsConfig::default());
    let instance = audit.clone();
    registry.register(
        "Audit,2.1",
        factory(move || {
            let instance: Arc<dyn DeliveryInterceptor> = instance.clone();
            Ok(instance)
        }),
    );

    let pool = WorkerPool::new(WorkerPoolConfig { max_workers: 4 }).unwrap();
    let context = Arc::new(
        BrokerContext::new(
            RouteRegistry::standalone(NodeId::new("heron")),
            pool,
            &PluginsConfig::default(),
        )
        .with_interceptors(registry),
    );
    let transport = MockTransport::builder().build();
    let config = DispatchConfig {
        interceptor: Some(" Audit , 2.1 ".to_string()),
        ..manual_config()
    };

    let first = DeliveryManager::builder(Destination::new("audited-1"), transport.clone())
        .config(config.clone())
        .register(&context)
        .await
        .unwrap();
    let second = DeliveryManager::builder(Destination::new("audited-2"), transport.clone())
        .config(config.clone())
        .register(&context)
        .await
        .unwrap();

    let err = DeliveryManager::builder(Destination::new("refused"), transport.clone())
        .config(config)
        .register(&context)
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Plugin(PluginError::Init { .. })));
    assert!(context.manager(&Destination::new("refused")).is_none());

    assert!(Arc::ptr_eq(first.interceptor(), second.interceptor()));
    assert_eq!(audit.versions.lock().as_slice(), ["2.1".to_string()]);
    assert_eq!(audit.managers.load(Ordering::SeqCst), 2);

    first.publish(QueueEntry::new(b"one".as_slice())).unwrap();
    second.publish(QueueEntry::new(b"two".as_slice())).unwrap();
    assert!(transport.wait_for_sent(2, Duration::from_secs(2)).await);
    assert!(eventually(|| audit.delivered.load(Ordering::SeqCst) == 2).await);

    context.shutdown().await;
    assert_eq!(audit.released.load(Ordering::SeqCst), 2);
    assert_eq!(audit.shut_down.load(Ordering::SeqCst), 1);
    assert!(first.is_shutdown());
    assert!(context.managers().is_empty());
}
