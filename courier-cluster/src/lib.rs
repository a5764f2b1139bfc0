//! Cluster routing for courier
//!
//! Every broker a message passes through appends a [`RouteInfo`] hop to the
//! message's [`Route`]. The [`RouteRegistry`] of the local node uses that
//! route to stop forwarding loops and to decide which node is closest to the
//! master of a topic.

mod error;
mod node_id;
pub mod registry;
mod route;

pub use error::RouteError;
pub use node_id::{FALLBACK_NODE_NAME, NODE_PREFIX, NodeId};
pub use registry::{ClusterConfig, RouteRegistry, Stamp, select_master, validate};
pub use route::{Route, RouteInfo, Timestamp};
