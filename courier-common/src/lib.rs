pub mod destination;
pub mod logging;

pub use destination::Destination;
pub use tracing;

/// Broadcast to every long-running task of the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
