use std::sync::Arc;

use ahash::AHashMap;
use courier_common::internal;
use dashmap::{DashMap, mapref::entry::Entry};
use serde::Deserialize;

use super::{DefaultInterceptor, DeliveryInterceptor, PriorityInterceptor, PriorityPolicy};
use crate::PluginError;

/// Builds a fresh interceptor instance.
pub type InterceptorFactory =
    Arc<dyn Fn() -> Result<Arc<dyn DeliveryInterceptor>, PluginError> + Send + Sync>;

/// Wrap a closure as an [`InterceptorFactory`].
pub fn factory<F>(build: F) -> InterceptorFactory
where
    F: Fn() -> Result<Arc<dyn DeliveryInterceptor>, PluginError> + Send + Sync + 'static,
{
    Arc::new(build)
}

/// Settings of the built-in interceptors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PluginsConfig {
    #[serde(default)]
    pub priority: PriorityPolicy,
}

/// Interceptor factories keyed by `"name,version"` and the singletons they
/// produced.
pub struct InterceptorRegistry {
    factories: AHashMap<String, InterceptorFactory>,
    instances: DashMap<String, Arc<dyn DeliveryInterceptor>, ahash::RandomState>,
}

impl InterceptorRegistry {
    /// A registry without any factory.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: AHashMap::new(),
            instances: DashMap::default(),
        }
    }

    /// A registry knowing `"Default,1.0"` and `"Priority,1.0"`.
    #[must_use]
    pub fn with_builtins(plugins: &PluginsConfig) -> Self {
        let mut registry = Self::empty();

        registry.register(
            "Default,1.0",
            factory(|| Ok(Arc::new(DefaultInterceptor) as Arc<dyn DeliveryInterceptor>)),
        );

        let policy = plugins.priority.clone();
        registry.register(
            "Priority,1.0",
            factory(move || {
                Ok(Arc::new(PriorityInterceptor::new(policy.clone())) as Arc<dyn DeliveryInterceptor>)
            }),
        );

        registry
    }

    /// Register or replace the factory for `key`.
    pub fn register(&mut self, key: &str, factory: InterceptorFactory) {
        match parse_key(key) {
            Ok((name, version)) => {
                self.factories.insert(format!("{name},{version}"), factory);
            }
            Err(e) => internal!(level = ERROR, "Not registering interceptor: {e}"),
        }
    }

    /// The singleton for `key`, created and initialised on first use.
    ///
    /// # Errors
    ///
    /// [`PluginError::MalformedKey`], [`PluginError::Unknown`], or whatever the
    /// factory or [`DeliveryInterceptor::initialize`] return.
    pub fn get_or_create(&self, key: &str) -> Result<Arc<dyn DeliveryInterceptor>, PluginError> {
        let (name, version) = parse_key(key)?;
        let key = format!("{name},{version}");

        if let Some(instance) = self.instances.get(&key) {
            return Ok(instance.value().clone());
        }

        let factory = self
            .factories
            .get(&key)
            .ok_or_else(|| PluginError::Unknown(key.clone()))?;

        match self.instances.entry(key) {
            Entry::Occupied(occupied) => Ok(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let instance = factory()?;
                instance.initialize(version)?;
                internal!(level = INFO, "Created delivery interceptor {}", vacant.key());
                Ok(vacant.insert(instance).value().clone())
            }
        }
    }

    #[must_use]
    pub fn is_registered(&self, key: &str) -> bool {
        parse_key(key).is_ok_and(|(name, version)| self.factories.contains_key(&format!("{name},{version}")))
    }

    /// Shut every created singleton down and forget it.
    pub fn shutdown_all(&self) {
        let keys: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((key, instance)) = self.instances.remove(&key) {
                internal!(level = DEBUG, "Shutting down delivery interceptor {key}");
                instance.shutdown();
            }
        }
    }
}

impl std::fmt::Debug for InterceptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorRegistry")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .field("instances", &self.instances.len())
            .finish()
    }
}

fn parse_key(key: &str) -> Result<(&str, &str), PluginError> {
    key.split_once(',')
        .map(|(name, version)| (name.trim(), version.trim()))
        .filter(|(name, version)| !name.is_empty() && !version.is_empty())
        .ok_or_else(|| PluginError::MalformedKey(key.to_string()))
}
