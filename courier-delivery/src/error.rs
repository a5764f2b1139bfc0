//! Typed error handling for dispatch operations.
//!
//! Transport failures are split into:
//! - Transient failures (destination unreachable, timed out) - retried by the
//!   connection state machine
//! - Rejections (the destination refused the entries) - never retried
//!
//! Everything else is either a capacity problem of the queue or a programming
//! error that is handed straight back to the caller.

use courier_cluster::RouteError;
use courier_common::Destination;
use courier_queue::QueueError;
use thiserror::Error;

/// Top-level dispatch error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A malformed route on an entry; never retried.
    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Destination {0} is already registered")]
    AlreadyRegistered(Destination),

    #[error("Destination {0} is shut down")]
    Shutdown(Destination),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Returns `true` if the failure is a connectivity problem that the
    /// connection state machine should retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_transient())
    }

    /// Returns `true` for errors caused by the caller rather than by the
    /// destination or the queue.
    #[must_use]
    pub const fn is_programming_error(&self) -> bool {
        matches!(self, Self::Route(_) | Self::Config(_) | Self::Plugin(_))
    }
}

/// Failures reported by a [`Transport`](crate::Transport).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Destination unreachable.
    #[error("Connection failed: {0}")]
    Unreachable(String),

    /// The transport gave up waiting for the destination.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The destination refused the whole batch.
    #[error("Rejected by destination: {0}")]
    Rejected(String),

    /// The transport answered with a different number of outcomes than
    /// entries it was given.
    #[error("Expected {expected} outcomes, transport returned {actual}")]
    OutcomeMismatch { expected: usize, actual: usize },
}

impl TransportError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Plugin lookup and lifecycle failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("No delivery interceptor registered as '{0}'")]
    Unknown(String),

    #[error("Malformed plugin key '{0}', expected 'name,version'")]
    MalformedKey(String),

    #[error("Plugin '{key}' failed to initialise: {reason}")]
    Init { key: String, reason: String },

    #[error("Destination {0} was never added to this plugin")]
    UnknownManager(Destination),
}

/// Invalid configuration values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failures of an access filter while compiling or evaluating a query.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Query '{query}' does not compile: {reason}")]
    Compile { query: String, reason: String },

    #[error("Query evaluation failed: {0}")]
    Evaluate(String),

    #[error("Prepared query has the wrong type for filter {0}")]
    WrongQueryType(String),
}
