use thiserror::Error;

use crate::NodeId;

/// A route that violates the stamping rules.
///
/// These are programming errors in whoever built the route and are returned
/// to the caller as-is.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Hop {index} has no usable node id")]
    UnnamedNode { index: usize },

    #[error("Hop {index} at {node} has stratum {stratum}, expected 0 or {expected}")]
    StratumGap {
        index: usize,
        node: NodeId,
        stratum: u32,
        expected: u32,
    },
}
