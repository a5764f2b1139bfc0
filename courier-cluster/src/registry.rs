//! Loop prevention and master selection for messages crossing cluster nodes.

use std::sync::Arc;

use courier_common::internal;
use serde::Deserialize;

use crate::{NodeId, Route, RouteError, RouteInfo, Timestamp};

/// Cluster identity of the local broker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    /// Name of this node, normalized like any other [`NodeId`].
    #[serde(default)]
    pub node_id: NodeId,

    /// Topics this node is master for. A trailing `*` matches by prefix.
    #[serde(default)]
    pub master_topics: Vec<String>,

    /// Whether hops stamped by this node may serve cached reads.
    #[serde(default)]
    pub dirty_read: bool,
}

/// Result of stamping a route at the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stamp {
    /// The local hop was appended; the message may travel on.
    Appended(RouteInfo),
    /// The local node is already on the route. Nothing was appended and the
    /// message must stay here.
    Loop { visits: usize },
}

impl Stamp {
    #[must_use]
    pub const fn is_loop(&self) -> bool {
        matches!(self, Self::Loop { .. })
    }
}

/// Routing decisions for the local node.
#[derive(Debug, Clone)]
pub struct RouteRegistry {
    node_id: NodeId,
    master_topics: Arc<[String]>,
    dirty_read: bool,
}

impl RouteRegistry {
    #[must_use]
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            node_id: config.node_id.clone(),
            master_topics: config.master_topics.iter().cloned().collect(),
            dirty_read: config.dirty_read,
        }
    }

    /// Registry for a stand-alone node that masters nothing explicitly.
    #[must_use]
    pub fn standalone(node_id: NodeId) -> Self {
        Self {
            node_id,
            master_topics: Arc::from([]),
            dirty_read: false,
        }
    }

    #[must_use]
    pub const fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Whether the local node is authoritative for `topic`.
    #[must_use]
    pub fn is_master_for(&self, topic: Option<&str>) -> bool {
        let Some(topic) = topic else {
            return false;
        };

        self.master_topics.iter().any(|pattern| {
            pattern
                .strip_suffix('*')
                .map_or_else(|| pattern == topic, |prefix| topic.starts_with(prefix))
        })
    }

    /// Append the local hop to `route`.
    ///
    /// The stratum is 0 when this node is master for the topic or when the
    /// message originates here (empty route), otherwise the previous hop's
    /// stratum plus one. A route that already visited this node is reported
    /// as [`Stamp::Loop`] and left untouched.
    ///
    /// # Errors
    ///
    /// Returns a [`RouteError`] if the existing route is malformed.
    pub fn stamp(&self, route: &mut Route, topic: Option<&str>) -> Result<Stamp, RouteError> {
        validate(route)?;

        let visits = route.count(&self.node_id);
        if visits > 0 {
            internal!(
                level = WARN,
                "Message already passed node {} ({visits} time(s)), route {route}; keeping it local",
                self.node_id
            );
            return Ok(Stamp::Loop { visits });
        }

        let stratum = match route.last() {
            _ if self.is_master_for(topic) => 0,
            None => 0,
            Some(previous) => previous.stratum.saturating_add(1),
        };

        let hop = RouteInfo::new(self.node_id.clone(), stratum, Timestamp::now())
            .with_dirty_read(self.dirty_read);
        route.push(hop.clone());

        Ok(Stamp::Appended(hop))
    }

    /// The route passed through this node while it acted as master.
    #[must_use]
    pub fn is_at_master(&self, route: &Route) -> bool {
        route
            .iter()
            .any(|hop| hop.stratum == 0 && !hop.dirty_read && hop.node_id == self.node_id)
    }

    /// Peers a message on `route` may still be forwarded to: the local node
    /// and every node already visited are excluded.
    #[must_use]
    pub fn forward_candidates<'a>(&self, route: &Route, peers: &'a [NodeId]) -> Vec<&'a NodeId> {
        peers
            .iter()
            .filter(|peer| **peer != self.node_id && !route.contains(peer))
            .collect()
    }
}

/// Check that strata only grow by one per hop or reset to zero at a master,
/// and that every hop is named.
///
/// Timestamps come from each node's own clock, so a hop older than its
/// predecessor is only logged.
///
/// # Errors
///
/// The first violation found, as a [`RouteError`].
pub fn validate(route: &Route) -> Result<(), RouteError> {
    let mut previous: Option<&RouteInfo> = None;

    for (index, hop) in route.iter().enumerate() {
        if hop.node_id.is_fallback() {
            return Err(RouteError::UnnamedNode { index });
        }

        if let Some(previous) = previous {
            let expected = previous.stratum.saturating_add(1);
            if hop.stratum != 0 && hop.stratum != expected {
                return Err(RouteError::StratumGap {
                    index,
                    node: hop.node_id.clone(),
                    stratum: hop.stratum,
                    expected,
                });
            }

            if hop.timestamp < previous.timestamp {
                internal!(
                    level = DEBUG,
                    "Hop {index} at {} is older than {}, clocks are skewed",
                    hop.node_id,
                    previous.node_id
                );
            }
        }

        previous = Some(hop);
    }

    Ok(())
}

/// Pick the hop closest to the authoritative node.
///
/// Smallest stratum wins, then the earliest timestamp, then the lexically
/// smallest node id, so every node in a cluster reaches the same answer.
pub fn select_master<'a, I>(candidates: I) -> Option<&'a RouteInfo>
where
    I: IntoIterator<Item = &'a RouteInfo>,
{
    candidates
        .into_iter()
        .min_by(|a, b| {
            a.stratum
                .cmp(&b.stratum)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.node_id.cmp(&b.node_id))
        })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn registry(node: &str, masters: &[&str]) -> RouteRegistry {
        RouteRegistry::new(&ClusterConfig {
            node_id: NodeId::new(node),
            master_topics: masters.iter().map(ToString::to_string).collect(),
            dirty_read: false,
        })
    }

    #[test]
    fn test_master_topic_patterns() {
        let registry = registry("avalon", &["news", "sport.*"]);

        assert!(registry.is_master_for(Some("news")));
        assert!(registry.is_master_for(Some("sport.football")));
        assert!(!registry.is_master_for(Some("newsflash")));
        assert!(!registry.is_master_for(None));
    }

    #[test]
    fn test_stamp_strata_along_chain() {
        let a = registry("a", &["topic"]);
        let b = registry("b", &[]);
        let c = registry("c", &[]);

        let mut route = Route::new();
        for node in [&a, &b, &c] {
            assert!(!node.stamp(&mut route, Some("topic")).unwrap().is_loop());
        }

        let strata: Vec<_> = route.iter().map(|hop| hop.stratum).collect();
        assert_eq!(strata, [0, 1, 2]);
        assert!(route.repeated_nodes().is_empty());
        assert!(validate(&route).is_ok());
    }

    #[test]
    fn test_stamp_master_resets_stratum() {
        let b = registry("b", &[]);
        let a = registry("a", &["topic"]);

        let mut route: Route = [RouteInfo::new(NodeId::new("x"), 0, Timestamp::from_nanos(1))]
            .into_iter()
            .collect();
        b.stamp(&mut route, Some("topic")).unwrap();
        a.stamp(&mut route, Some("topic")).unwrap();

        let strata: Vec<_> = route.iter().map(|hop| hop.stratum).collect();
        assert_eq!(strata, [0, 1, 0]);
        assert!(a.is_at_master(&route));
        assert!(!b.is_at_master(&route));
    }

    #[test]
    fn test_stamp_detects_loop_without_appending() {
        let a = registry("a", &[]);
        let b = registry("b", &[]);

        let mut route = Route::new();
        a.stamp(&mut route, None).unwrap();
        b.stamp(&mut route, None).unwrap();

        let before = route.clone();
        assert_eq!(a.stamp(&mut route, None), Ok(Stamp::Loop { visits: 1 }));
        assert_eq!(route, before);
    }

    #[test]
    fn test_validate_rejects_malformed_routes() {
        let gap: Route = [
            RouteInfo::new(NodeId::new("a"), 0, Timestamp::from_nanos(1)),
            RouteInfo::new(NodeId::new("b"), 3, Timestamp::from_nanos(2)),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            validate(&gap),
            Err(RouteError::StratumGap {
                index: 1,
                node: NodeId::new("b"),
                stratum: 3,
                expected: 1,
            })
        );

        let unnamed: Route = [RouteInfo::new(NodeId::new(""), 0, Timestamp::from_nanos(1))]
            .into_iter()
            .collect();
        assert_eq!(validate(&unnamed), Err(RouteError::UnnamedNode { index: 0 }));

        let mut route = gap;
        assert!(registry("c", &[]).stamp(&mut route, None).is_err());
    }

    #[test]
    fn test_skewed_clocks_are_accepted() {
        let mut route: Route = [
            RouteInfo::new(NodeId::new("a"), 0, Timestamp::from_nanos(1_000_000_100)),
            RouteInfo::new(NodeId::new("b"), 1, Timestamp::from_nanos(1_000_000_000)),
        ]
        .into_iter()
        .collect();
        assert_eq!(validate(&route), Ok(()));

        let stamp = registry("c", &[]).stamp(&mut route, None).unwrap();
        assert!(matches!(stamp, Stamp::Appended(ref hop) if hop.stratum == 2));
        assert_eq!(route.len(), 3);
    }

    #[test]
    fn test_select_master_orders_by_stratum_time_then_name() {
        let hops = [
            RouteInfo::new(NodeId::new("c"), 2, Timestamp::from_nanos(30)),
            RouteInfo::new(NodeId::new("a"), 0, Timestamp::from_nanos(10)),
            RouteInfo::new(NodeId::new("b"), 1, Timestamp::from_nanos(20)),
        ];
        assert_eq!(select_master(&hops).map(|hop| hop.node_id.as_str()), Some("a"));

        let tied_stratum = [
            RouteInfo::new(NodeId::new("x"), 1, Timestamp::from_nanos(20)),
            RouteInfo::new(NodeId::new("y"), 1, Timestamp::from_nanos(10)),
        ];
        assert_eq!(
            select_master(&tied_stratum).map(|hop| hop.node_id.as_str()),
            Some("y")
        );

        let tied_time = [
            RouteInfo::new(NodeId::new("zulu"), 1, Timestamp::from_nanos(10)),
            RouteInfo::new(NodeId::new("echo"), 1, Timestamp::from_nanos(10)),
        ];
        assert_eq!(
            select_master(&tied_time).map(|hop| hop.node_id.as_str()),
            Some("echo")
        );

        assert!(select_master(&[] as &[RouteInfo]).is_none());
    }

    #[test]
    fn test_forward_candidates_skip_visited_nodes() {
        let b = registry("b", &[]);
        let mut route = Route::new();
        registry("a", &[]).stamp(&mut route, None).unwrap();
        b.stamp(&mut route, None).unwrap();

        let peers = [NodeId::new("a"), NodeId::new("b"), NodeId::new("c")];
        assert_eq!(b.forward_candidates(&route, &peers), [&NodeId::new("c")]);
    }
}
