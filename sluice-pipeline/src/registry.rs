//! Lookup of plugin implementations by name.

use std::fmt;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;

use crate::aggregation::{Aggregation, BasicStats, BasicStatsConfig, MinMax, Sum};
use crate::error::{ConfigurationError, ConfigurationErrorKind};
use crate::processor::{Processor, Round, RoundConfig};
use crate::sink::{DiscardSink, Sink};
use crate::source::Source;

type Factory<T> = Box<dyn Fn(serde_json::Value) -> Result<T, ConfigurationError> + Send + Sync>;

/// Factories for every kind of plugin, keyed by plugin name.
///
/// The registry is built explicitly at startup and passed to
/// [`Pipeline::from_config`](crate::Pipeline::from_config). Factories receive the plugin-specific
/// `options` of an instance. Registration order is preserved, so listings are deterministic.
#[derive(Default)]
pub struct PluginRegistry {
    sources: IndexMap<String, Factory<Box<dyn Source>>>,
    processors: IndexMap<String, Factory<Box<dyn Processor>>>,
    aggregations: IndexMap<String, Factory<Box<dyn Aggregation>>>,
    sinks: IndexMap<String, Factory<Box<dyn Sink>>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the plugins shipped with the pipeline.
    ///
    /// These are the `sum`, `minmax` and `basicstats` aggregations, the `round` processor and the
    /// `discard` sink.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        builtin(&mut registry.aggregations, "sum", |_| Ok(Box::new(Sum::default())));
        builtin(&mut registry.aggregations, "minmax", |_| {
            Ok(Box::new(MinMax::default()))
        });
        builtin(&mut registry.aggregations, "basicstats", |value| {
            let config: BasicStatsConfig = options(value)?;
            Ok(Box::new(BasicStats::new(config)))
        });
        builtin(&mut registry.processors, "round", |value| {
            let config: RoundConfig = options(value)?;
            Ok(Box::new(Round::new(config)))
        });
        builtin(&mut registry.sinks, "discard", |_| Ok(Box::new(DiscardSink)));

        registry
    }

    /// Registers a source plugin.
    pub fn register_source<F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> Result<(), ConfigurationError>
    where
        F: Fn(serde_json::Value) -> Result<Box<dyn Source>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        register(&mut self.sources, name.into(), Box::new(factory))
    }

    /// Registers a processor plugin.
    pub fn register_processor<F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> Result<(), ConfigurationError>
    where
        F: Fn(serde_json::Value) -> Result<Box<dyn Processor>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        register(&mut self.processors, name.into(), Box::new(factory))
    }

    /// Registers an aggregation algorithm.
    pub fn register_aggregation<F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> Result<(), ConfigurationError>
    where
        F: Fn(serde_json::Value) -> Result<Box<dyn Aggregation>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        register(&mut self.aggregations, name.into(), Box::new(factory))
    }

    /// Registers a sink plugin.
    pub fn register_sink<F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> Result<(), ConfigurationError>
    where
        F: Fn(serde_json::Value) -> Result<Box<dyn Sink>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        register(&mut self.sinks, name.into(), Box::new(factory))
    }

    /// Creates a source from its options.
    pub fn source(
        &self,
        name: &str,
        options: serde_json::Value,
    ) -> Result<Box<dyn Source>, ConfigurationError> {
        create(&self.sources, name, options)
    }

    /// Creates a processor from its options.
    pub fn processor(
        &self,
        name: &str,
        options: serde_json::Value,
    ) -> Result<Box<dyn Processor>, ConfigurationError> {
        create(&self.processors, name, options)
    }

    /// Creates an aggregation algorithm from its options.
    pub fn aggregation(
        &self,
        name: &str,
        options: serde_json::Value,
    ) -> Result<Box<dyn Aggregation>, ConfigurationError> {
        create(&self.aggregations, name, options)
    }

    /// Creates a sink from its options.
    pub fn sink(
        &self,
        name: &str,
        options: serde_json::Value,
    ) -> Result<Box<dyn Sink>, ConfigurationError> {
        create(&self.sinks, name, options)
    }

    /// Returns the names of all registered plugins by kind, in registration order.
    pub fn names(&self) -> PluginNames<'_> {
        PluginNames {
            sources: self.sources.keys().map(String::as_str).collect(),
            processors: self.processors.keys().map(String::as_str).collect(),
            aggregations: self.aggregations.keys().map(String::as_str).collect(),
            sinks: self.sinks.keys().map(String::as_str).collect(),
        }
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Registered plugin names, see [`PluginRegistry::names`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PluginNames<'a> {
    /// Source plugins.
    pub sources: Vec<&'a str>,
    /// Processor plugins.
    pub processors: Vec<&'a str>,
    /// Aggregation algorithms.
    pub aggregations: Vec<&'a str>,
    /// Sink plugins.
    pub sinks: Vec<&'a str>,
}

/// Deserializes plugin options, using the defaults if none are given.
pub fn options<T>(value: serde_json::Value) -> Result<T, ConfigurationError>
where
    T: DeserializeOwned + Default,
{
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value).map_err(ConfigurationError::options)
}

fn builtin<T, F>(factories: &mut IndexMap<String, Factory<T>>, name: &str, factory: F)
where
    F: Fn(serde_json::Value) -> Result<T, ConfigurationError> + Send + Sync + 'static,
{
    factories.insert(name.to_owned(), Box::new(factory));
}

fn register<T>(
    factories: &mut IndexMap<String, Factory<T>>,
    name: String,
    factory: Factory<T>,
) -> Result<(), ConfigurationError> {
    if factories.contains_key(&name) {
        return Err(ConfigurationErrorKind::DuplicatePlugin(name).into());
    }
    factories.insert(name, factory);
    Ok(())
}

fn create<T>(
    factories: &IndexMap<String, Factory<T>>,
    name: &str,
    options: serde_json::Value,
) -> Result<T, ConfigurationError> {
    match factories.get(name) {
        Some(factory) => factory(options),
        None => Err(ConfigurationErrorKind::UnknownPlugin(name.to_owned()).into()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_builtins() {
        let registry = PluginRegistry::with_builtins();

        similar_asserts::assert_eq!(
            registry.names(),
            PluginNames {
                sources: vec![],
                processors: vec!["round"],
                aggregations: vec!["sum", "minmax", "basicstats"],
                sinks: vec!["discard"],
            }
        );
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = PluginRegistry::with_builtins();

        let error = registry
            .register_sink("discard", |_| Ok(Box::new(DiscardSink)))
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid configuration: plugin \"discard\" is registered twice"
        );
    }

    #[test]
    fn test_unknown_plugin() {
        let registry = PluginRegistry::with_builtins();

        let Err(error) = registry.aggregation("histogram", serde_json::Value::Null) else {
            panic!("histogram is not a builtin");
        };
        assert_eq!(
            error.to_string(),
            "invalid configuration: unknown plugin \"histogram\""
        );
    }

    #[test]
    fn test_invalid_options() {
        let registry = PluginRegistry::with_builtins();

        assert!(registry.processor("round", json!({"precision": 2})).is_ok());
        assert!(registry.processor("round", json!({"precision": "two"})).is_err());
        assert!(registry.aggregation("basicstats", json!(null)).is_ok());
    }
}
