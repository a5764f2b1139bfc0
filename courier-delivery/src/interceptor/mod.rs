//! Pluggable selection of what a drain worker sends next.
//!
//! An interceptor is a per-broker singleton shared by every destination that
//! names it. It decides whether a worker is scheduled at all
//! ([`DeliveryInterceptor::do_activate`]) and which entries form the next
//! batch, in which order ([`DeliveryInterceptor::handle_next_messages`]).

mod default;
mod priority;
mod registry;

use courier_queue::QueueEntry;

pub use default::DefaultInterceptor;
pub use priority::{ActionKind, DispatchAction, PriorityInterceptor, PriorityPolicy, PriorityRule};
pub use registry::{InterceptorFactory, InterceptorRegistry, PluginsConfig, factory};

use crate::{DeliveryError, DeliveryManager, PluginError};

pub trait DeliveryInterceptor: Send + Sync {
    /// Called once after the registry created the instance, with the version
    /// part of its `"name,version"` key.
    ///
    /// # Errors
    ///
    /// [`PluginError::Init`] if the instance cannot work with this version.
    fn initialize(&self, _version: &str) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called once per destination when its manager registers.
    ///
    /// # Errors
    ///
    /// Refuses the destination; registration fails with this error.
    fn add_delivery_manager(&self, _manager: &DeliveryManager) -> Result<(), PluginError> {
        Ok(())
    }

    /// Whether new entries should schedule a worker.
    fn do_activate(&self, manager: &DeliveryManager) -> bool;

    /// The next batch to send, in delivery order. An empty batch ends the
    /// drain cycle.
    ///
    /// `push` carries caller supplied entries in push mode and must be
    /// honoured instead of reading the queue.
    ///
    /// # Errors
    ///
    /// Queue or plugin failures; the worker stops and
    /// [`DeliveryInterceptor::on_worker_error`] is called.
    fn handle_next_messages(
        &self,
        manager: &DeliveryManager,
        push: Option<Vec<QueueEntry>>,
    ) -> Result<Vec<QueueEntry>, DeliveryError>;

    /// Called with the acknowledged entries after a batch was delivered.
    fn post_handle_next_messages(&self, _manager: &DeliveryManager, _delivered: &[QueueEntry]) {}

    fn to_alive(&self, _manager: &DeliveryManager) {}

    fn to_polling(&self, _manager: &DeliveryManager) {}

    fn to_dead(&self, _manager: &DeliveryManager, _error: Option<&str>) {}

    fn on_worker_error(&self, _manager: &DeliveryManager, _error: &DeliveryError) {}

    /// Forget a destination that shuts down.
    fn shutdown_manager(&self, _manager: &DeliveryManager) {}

    /// Tear the singleton down. Called once by the registry.
    fn shutdown(&self) {}
}
