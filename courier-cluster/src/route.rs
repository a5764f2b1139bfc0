//! Route annotations carried by a message across cluster nodes.

use std::{
    fmt::{self, Display},
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::NodeId;

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Receive time of a hop in nanoseconds since the Unix epoch.
///
/// Timestamps handed out by [`Timestamp::now`] are strictly increasing within
/// one process, even when the wall clock stalls or steps backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    #[must_use]
    pub fn now() -> Self {
        let wall = chrono::Utc::now()
            .timestamp_nanos_opt()
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or_default();

        let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Self(next),
                Err(current) => last = current,
            }
        }
    }

    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = i64::try_from(self.0).unwrap_or(i64::MAX);
        let time = chrono::DateTime::from_timestamp_nanos(nanos);
        write!(f, "{}", time.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
    }
}

/// One hop of a message through the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteInfo {
    pub node_id: NodeId,
    /// Hop distance from the node that is master for the message's topic.
    pub stratum: u32,
    pub timestamp: Timestamp,
    /// Whether this hop may answer reads from its cached copy.
    #[serde(default)]
    pub dirty_read: bool,
}

impl RouteInfo {
    #[must_use]
    pub const fn new(node_id: NodeId, stratum: u32, timestamp: Timestamp) -> Self {
        Self {
            node_id,
            stratum,
            timestamp,
            dirty_read: false,
        }
    }

    #[must_use]
    pub const fn with_dirty_read(mut self, dirty_read: bool) -> Self {
        self.dirty_read = dirty_read;
        self
    }
}

impl Display for RouteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[stratum={}, dirtyRead={}]",
            self.node_id, self.stratum, self.dirty_read
        )
    }
}

/// Ordered, append-only list of the hops a message has taken.
///
/// A node that shows up twice is a forwarding loop; the route keeps it so the
/// loop can be detected instead of silently rewritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Route(Vec<RouteInfo>);

impl Route {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, hop: RouteInfo) {
        self.0.push(hop);
    }

    #[must_use]
    pub fn hops(&self) -> &[RouteInfo] {
        &self.0
    }

    #[must_use]
    pub fn last(&self) -> Option<&RouteInfo> {
        self.0.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RouteInfo> {
        self.0.iter()
    }

    /// How many times `node` appears on the route.
    #[must_use]
    pub fn count(&self, node: &NodeId) -> usize {
        self.0.iter().filter(|hop| &hop.node_id == node).count()
    }

    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.iter().any(|hop| &hop.node_id == node)
    }

    /// The dirty-read flag of the first hop at `node`, `false` if it never
    /// visited that node.
    #[must_use]
    pub fn dirty_read(&self, node: &NodeId) -> bool {
        self.0
            .iter()
            .find(|hop| &hop.node_id == node)
            .is_some_and(|hop| hop.dirty_read)
    }

    /// Nodes visited more than once, in order of first appearance.
    #[must_use]
    pub fn repeated_nodes(&self) -> Vec<&NodeId> {
        let mut seen = ahash::AHashSet::new();
        let mut repeated = Vec::new();
        for hop in &self.0 {
            if !seen.insert(&hop.node_id) && !repeated.contains(&&hop.node_id) {
                repeated.push(&hop.node_id);
            }
        }
        repeated
    }
}

impl<'a> IntoIterator for &'a Route {
    type Item = &'a RouteInfo;
    type IntoIter = std::slice::Iter<'a, RouteInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<RouteInfo> for Route {
    fn from_iter<T: IntoIterator<Item = RouteInfo>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, hop) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{hop}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(node: &str, stratum: u32, nanos: u64) -> RouteInfo {
        RouteInfo::new(NodeId::new(node), stratum, Timestamp::from_nanos(nanos))
    }

    #[test]
    fn test_timestamp_strictly_increasing() {
        let mut previous = Timestamp::now();
        for _ in 0..1000 {
            let next = Timestamp::now();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_route_info_dirty_read_defaults_false() {
        assert!(!hop("heron", 0, 1).dirty_read);

        let parsed: RouteInfo =
            ron::from_str("(node_id: \"heron\", stratum: 1, timestamp: 42)").unwrap();
        assert!(!parsed.dirty_read);
        assert_eq!(parsed.stratum, 1);
    }

    #[test]
    fn test_route_counts_and_dirty_read() {
        let route: Route = [
            hop("avalon", 0, 1),
            hop("golan", 1, 2).with_dirty_read(true),
            hop("avalon", 2, 3),
        ]
        .into_iter()
        .collect();

        assert_eq!(route.count(&NodeId::new("avalon")), 2);
        assert_eq!(route.count(&NodeId::new("frodo")), 0);
        assert!(route.dirty_read(&NodeId::new("golan")));
        assert!(!route.dirty_read(&NodeId::new("avalon")));
        assert!(!route.dirty_read(&NodeId::new("frodo")));
        assert_eq!(route.repeated_nodes(), [&NodeId::new("avalon")]);
    }

    #[test]
    fn test_route_display() {
        let route: Route = [hop("avalon", 0, 1), hop("golan", 1, 2)].into_iter().collect();
        assert_eq!(
            route.to_string(),
            "avalon[stratum=0, dirtyRead=false] -> golan[stratum=1, dirtyRead=false]"
        );
    }
}
