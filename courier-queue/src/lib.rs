//! Queue contract for courier destinations
//!
//! A destination's pending entries live in a [`Queue`]. The delivery core only
//! relies on the trait; [`MemoryQueue`] is the bounded in-memory implementation
//! used for transient destinations, dead letters and tests.

pub mod backends;
pub mod entry;
pub mod error;
pub mod r#trait;

pub use backends::{MemoryQueue, MemoryQueueConfig};
pub use entry::{EntryId, Priority, QueueEntry};
pub use error::{QueueError, Result};
pub use r#trait::{PeekLimit, PutListener, Queue};
