//! Destination newtype
//!
//! A destination is anything a broker delivers to: a subscriber callback, a
//! cluster peer or a point-to-point recipient. Wrapping the address keeps it
//! from being mixed up with node names or topic keys.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// An addressable delivery target.
///
/// # Examples
///
/// ```
/// use courier_common::Destination;
///
/// let destination = Destination::new("callback:joe/1");
/// assert_eq!(destination.as_str(), "callback:joe/1");
///
/// let destination: Destination = "cluster:heron".into();
/// assert_eq!(destination.as_str(), "cluster:heron");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Destination(Arc<str>);

impl Destination {
    #[must_use]
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> Arc<str> {
        self.0
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Destination {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Destination {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for Destination {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&str> for Destination {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<Arc<str>> for Destination {
    fn from(s: Arc<str>) -> Self {
        Self(s)
    }
}
