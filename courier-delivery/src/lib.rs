//! Dispatch core for courier destinations
//!
//! Every destination a broker delivers to is served by a [`DeliveryManager`].
//! The manager owns the destination's [`ConnectionState`], schedules at most
//! one drain worker at a time on the broker's [`WorkerPool`], asks the
//! configured [`DeliveryInterceptor`] for the next batch and hands it to the
//! [`Transport`]. Entries that can never be delivered go to an
//! [`ErrorHandler`].
//!
//! ## Connection states
//!
//! - **ALIVE**: batches are sent as soon as entries arrive
//! - **POLLING**: the destination is unreachable; entries stay queued and a
//!   reconnect timer probes it with growing delays
//! - **DEAD**: the retry budget is used up; everything queued is escalated
//!
//! Shared state (node identity, interceptor singletons, the worker pool,
//! prepared filter queries) lives in a [`BrokerContext`] passed to every
//! manager.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod escalation;
pub mod filter;
pub mod interceptor;
pub mod manager;
pub mod pool;
pub mod stats;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use config::{DEFAULT_INTERCEPTOR, DispatchConfig};
pub use connection::{ConnectionState, ConnectionStateEnum, ConnectionStatusListener, Transition};
pub use context::BrokerContext;
pub use error::{ConfigError, DeliveryError, FilterError, PluginError, TransportError};
pub use escalation::{
    DeadLetterHandler, DiscardHandler, ErrorHandler, EscalationCause, EscalationConfig, LogHandler,
    MsgErrorInfo, PropagateHandler,
};
pub use filter::{Filter, FilterBinding, PreparedQuery, PreparedQueryCache};
pub use interceptor::{
    ActionKind, DefaultInterceptor, DeliveryInterceptor, DispatchAction, InterceptorFactory,
    InterceptorRegistry, PluginsConfig, PriorityInterceptor, PriorityPolicy, PriorityRule, factory,
};
pub use manager::{CycleEnd, DeliveryManager, DeliveryManagerBuilder};
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use stats::{DeliveryStats, StatsSnapshot};
pub use transport::{Outcome, Transport};
