//! Access filters and the prepared query cache.
//!
//! Filters themselves (regular expressions, SQL-like selectors, ...) live
//! outside the dispatch core. The core only compiles each query once per
//! filter and reuses the compiled form for every entry.

use std::{any::Any, fmt, sync::Arc};

use courier_queue::QueueEntry;
use dashmap::DashMap;

use crate::FilterError;

/// A compiled query, opaque to everyone but the filter that built it.
#[derive(Clone)]
pub struct PreparedQuery(Arc<dyn Any + Send + Sync>);

impl PreparedQuery {
    pub fn new<T: Any + Send + Sync>(compiled: T) -> Self {
        Self(Arc::new(compiled))
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for PreparedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PreparedQuery")
    }
}

/// Content based predicate over queued entries.
pub trait Filter: Send + Sync {
    /// Name the cache keys compiled queries by.
    fn name(&self) -> &str;

    /// Compile `query` into the filter's internal representation.
    ///
    /// # Errors
    ///
    /// [`FilterError::Compile`] if the query is invalid.
    fn compile(&self, query: &str) -> Result<PreparedQuery, FilterError>;

    /// Evaluate a compiled query against an entry.
    ///
    /// # Errors
    ///
    /// [`FilterError::Evaluate`] or [`FilterError::WrongQueryType`].
    fn matches(&self, entry: &QueueEntry, query: &PreparedQuery) -> Result<bool, FilterError>;
}

/// Compiled queries shared by every destination of a broker, keyed by
/// (filter name, query text).
#[derive(Debug, Default)]
pub struct PreparedQueryCache {
    queries: DashMap<(Arc<str>, Arc<str>), PreparedQuery, ahash::RandomState>,
}

impl PreparedQueryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get_prepared_query(&self, filter: &str, query: &str) -> Option<PreparedQuery> {
        self.queries
            .get(&(Arc::from(filter), Arc::from(query)))
            .map(|prepared| prepared.value().clone())
    }

    pub fn set_prepared_query(&self, filter: &str, query: &str, prepared: PreparedQuery) {
        self.queries
            .insert((Arc::from(filter), Arc::from(query)), prepared);
    }

    /// Return the cached compilation of `query`, compiling it on first use.
    ///
    /// # Errors
    ///
    /// Whatever [`Filter::compile`] returns; failures are not cached.
    pub fn get_or_compile(&self, filter: &dyn Filter, query: &str) -> Result<PreparedQuery, FilterError> {
        let key = (Arc::from(filter.name()), Arc::from(query));
        if let Some(prepared) = self.queries.get(&key) {
            return Ok(prepared.value().clone());
        }

        let prepared = filter.compile(query)?;
        Ok(self.queries.entry(key).or_insert(prepared).value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// A filter together with the query a destination subscribed with.
#[derive(Clone)]
pub struct FilterBinding {
    pub filter: Arc<dyn Filter>,
    pub query: Arc<str>,
}

impl FilterBinding {
    #[must_use]
    pub fn new(filter: Arc<dyn Filter>, query: impl Into<Arc<str>>) -> Self {
        Self {
            filter,
            query: query.into(),
        }
    }

    /// Evaluate the binding's query against `entry` through `cache`.
    ///
    /// # Errors
    ///
    /// Compile or evaluation failures of the filter.
    pub fn matches(&self, cache: &PreparedQueryCache, entry: &QueueEntry) -> Result<bool, FilterError> {
        let prepared = cache.get_or_compile(self.filter.as_ref(), &self.query)?;
        self.filter.matches(entry, &prepared)
    }
}

impl fmt::Debug for FilterBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterBinding")
            .field("filter", &self.filter.name())
            .field("query", &self.query)
            .finish()
    }
}
