use courier_queue::QueueEntry;

use super::DeliveryInterceptor;
use crate::{DeliveryError, DeliveryManager};

/// Sends the leading run of highest priority entries as they are queued.
///
/// Registered as `"Default,1.0"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultInterceptor;

impl DeliveryInterceptor for DefaultInterceptor {
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
}
