use std::sync::{Arc, Weak};

use courier_cluster::RouteRegistry;
use courier_common::{Destination, internal};
use courier_queue::MemoryQueue;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    DeliveryError, DeliveryManager, InterceptorRegistry, PluginsConfig, PreparedQueryCache,
    WorkerPool,
};

/// Everything the destinations of one broker share.
///
/// Passed to every [`DeliveryManager`] on registration instead of living in
/// process wide statics, so several brokers can run in one process.
#[derive(Debug)]
pub struct BrokerContext {
    routes: RouteRegistry,
    interceptors: InterceptorRegistry,
    pool: WorkerPool,
    queries: PreparedQueryCache,
    dead_letters: Arc<MemoryQueue>,
    managers: DashMap<Destination, Weak<DeliveryManager>, ahash::RandomState>,
}

impl BrokerContext {
    /// A context with the built-in interceptors and an unbounded dead-letter
    /// queue.
    #[must_use]
    pub fn new(routes: RouteRegistry, pool: WorkerPool, plugins: &PluginsConfig) -> Self {
        Self {
            routes,
            interceptors: InterceptorRegistry::with_builtins(plugins),
            pool,
            queries: PreparedQueryCache::new(),
            dead_letters: Arc::new(MemoryQueue::new("dead-letter")),
            managers: DashMap::default(),
        }
    }

    #[must_use]
    pub fn with_interceptors(mut self, interceptors: InterceptorRegistry) -> Self {
        self.interceptors = interceptors;
        self
    }

    #[must_use]
    pub fn with_dead_letters(mut self, dead_letters: Arc<MemoryQueue>) -> Self {
        self.dead_letters = dead_letters;
        self
    }

    #[must_use]
    pub const fn routes(&self) -> &RouteRegistry {
        &self.routes
    }

    #[must_use]
    pub const fn interceptors(&self) -> &InterceptorRegistry {
        &self.interceptors
    }

    #[must_use]
    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    #[must_use]
    pub const fn queries(&self) -> &PreparedQueryCache {
        &self.queries
    }

    #[must_use]
    pub const fn dead_letters(&self) -> &Arc<MemoryQueue> {
        &self.dead_letters
    }

    /// The live manager of `destination`, if any.
    #[must_use]
    pub fn manager(&self, destination: &Destination) -> Option<Arc<DeliveryManager>> {
        self.managers
            .get(destination)
            .and_then(|manager| manager.value().upgrade())
            .filter(|manager| !manager.is_shutdown())
    }

    /// Every live manager.
    #[must_use]
    pub fn managers(&self) -> Vec<Arc<DeliveryManager>> {
        self.managers
            .iter()
            .filter_map(|manager| manager.value().upgrade())
            .filter(|manager| !manager.is_shutdown())
            .collect()
    }

    /// Claim `destination` for `manager`. A previous manager that was shut
    /// down or dropped is replaced.
    pub(crate) fn register_manager(
        &self,
        destination: &Destination,
        manager: Weak<DeliveryManager>,
    ) -> Result<(), DeliveryError> {
        match self.managers.entry(destination.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied
                    .get()
                    .upgrade()
                    .is_some_and(|existing| !existing.is_shutdown())
                {
                    return Err(DeliveryError::AlreadyRegistered(destination.clone()));
                }
                occupied.insert(manager);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(manager);
            }
        }

        Ok(())
    }

    /// Forget `destination` if it still belongs to `manager`.
    pub(crate) fn deregister_manager(&self, destination: &Destination, manager: &Weak<DeliveryManager>) {
        self.managers
            .remove_if(destination, |_, registered| registered.ptr_eq(manager));
    }

    /// Shut every destination down, then the interceptors, then the pool.
    pub async fn shutdown(&self) {
        let managers = self.managers();
        internal!(level = INFO, "Shutting down {} destinations", managers.len());

        for manager in managers {
            manager.shutdown().await;
        }

        self.interceptors.shutdown_all();
        self.pool.close();
    }
}
