//! Normalized cluster node names.

use std::{
    fmt::{self, Display},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// Canonical prefix of a node path, e.g. `/node/heron/client/joe`.
pub const NODE_PREFIX: &str = "/node/";

/// Name used whenever a node id cannot be derived from the input.
pub const FALLBACK_NODE_NAME: &str = "NoNameNode";

/// Unique name of one broker instance in a cluster.
///
/// Construction never fails: `/node/` is stripped, everything after the next
/// `/` is dropped, characters that are not alphanumeric or one of `_`, `-`
/// and `.` become `_`, and input that leaves nothing behind yields
/// [`FALLBACK_NODE_NAME`].
///
/// ```
/// use courier_cluster::NodeId;
///
/// assert_eq!(NodeId::new("/node/heron/client/joe").as_str(), "heron");
/// assert_eq!(NodeId::new("").as_str(), "NoNameNode");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct NodeId(Arc<str>);

impl NodeId {
    #[must_use]
    pub fn new(raw: &str) -> Self {
        Self(Arc::from(normalize(raw).as_str()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` when the id is the fallback sentinel rather than a real name.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        &*self.0 == FALLBACK_NODE_NAME
    }
}

fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_prefix = if trimmed == NODE_PREFIX.trim_end_matches('/') {
        ""
    } else {
        trimmed.strip_prefix(NODE_PREFIX).unwrap_or(trimmed)
    };
    let without_prefix = without_prefix.trim_start_matches('/');
    let name = without_prefix.split('/').next().unwrap_or_default();

    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.is_empty() || name.chars().all(|c| c == '_') {
        FALLBACK_NODE_NAME.to_string()
    } else {
        name
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self(Arc::from(FALLBACK_NODE_NAME))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for NodeId {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(&raw))
    }
}
