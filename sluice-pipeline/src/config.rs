//! Configuration of the pipeline and its plugin instances.
//!
//! All structures implement `serde` traits so they can be embedded into any configuration format.
//! Missing keys fall back to their documented defaults. Durations are given in whole seconds.
//! Plugin-specific settings are passed through as opaque `options` to the plugin factory.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use sluice_log::Level;

use crate::error::ConfigurationErrorKind;
use crate::filter::FilterConfig;
use crate::point::{DataPoint, Tags};

/// Settings shared by all instances of a pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Default collection interval of sources in seconds.
    ///
    /// Defaults to `10` seconds.
    pub interval: u64,

    /// Aligns collection and aggregation windows to multiples of their interval.
    ///
    /// Defaults to `true`. With an interval of `10` seconds, collection happens at `:00`, `:10`,
    /// and so on, rather than relative to the start of the pipeline.
    pub round_interval: bool,

    /// Maximum random delay in seconds added to each collection.
    ///
    /// Defaults to `0`. Spreads the load of many sources with the same interval.
    pub collection_jitter: u64,

    /// Default interval of sink flushes in seconds.
    ///
    /// Defaults to `10` seconds.
    pub flush_interval: u64,

    /// Maximum random delay in seconds added to each sink flush.
    ///
    /// Defaults to `0`.
    pub flush_jitter: u64,

    /// Maximum number of points handed to a sink in one write.
    ///
    /// Defaults to `1000`.
    pub metric_batch_size: usize,

    /// Maximum number of points buffered per sink.
    ///
    /// Defaults to `10000`. When exceeded, the oldest points are dropped.
    pub metric_buffer_limit: usize,

    /// Time in seconds to drain the pipeline after a shutdown was requested.
    ///
    /// Defaults to `10` seconds. Shutdowns without a timeout use this value.
    pub shutdown_timeout: u64,
}

impl AgentConfig {
    /// Returns the default collection interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Returns the maximum collection jitter.
    pub fn collection_jitter(&self) -> Duration {
        Duration::from_secs(self.collection_jitter)
    }

    /// Returns the default flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval)
    }

    /// Returns the maximum flush jitter.
    pub fn flush_jitter(&self) -> Duration {
        Duration::from_secs(self.flush_jitter)
    }

    /// Returns the time budget for draining the pipeline.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interval: 10,
            round_interval: true,
            collection_jitter: 0,
            flush_interval: 10,
            flush_jitter: 0,
            metric_batch_size: 1000,
            metric_buffer_limit: 10_000,
            shutdown_timeout: 10,
        }
    }
}

/// Renaming and tagging applied to every point a plugin instance emits.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Decorations {
    /// Replaces the measurement name.
    pub name_override: Option<String>,
    /// Prepended to the measurement name.
    pub measurement_prefix: Option<String>,
    /// Appended to the measurement name.
    pub measurement_suffix: Option<String>,
    /// Added to every point, unless the point already has a tag with the same key.
    pub tags: Tags,
}

impl Decorations {
    /// Applies renaming and tags to a point.
    pub fn apply(&self, point: &mut DataPoint) {
        if let Some(ref name) = self.name_override {
            point.name.clone_from(name);
        }

        if let Some(ref prefix) = self.measurement_prefix {
            point.name.insert_str(0, prefix);
        }

        if let Some(ref suffix) = self.measurement_suffix {
            point.name.push_str(suffix);
        }

        for (key, value) in &self.tags {
            if !point.tags.contains_key(key) {
                point.tags.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Configuration of a source instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Name of the registered source plugin.
    pub plugin: String,
    /// Distinguishes multiple instances of the same plugin in logs and metrics.
    pub alias: Option<String>,
    /// Collection interval in seconds. Defaults to the agent interval.
    pub interval: Option<u64>,
    /// Renaming and tags for collected points.
    #[serde(flatten)]
    pub decorations: Decorations,
    /// Selection of collected points.
    #[serde(flatten)]
    pub filter: FilterConfig,
    /// Caps the verbosity of this instance's diagnostics.
    pub log_level: Option<Level>,
    /// Plugin-specific options.
    pub options: serde_json::Value,
}

impl SourceConfig {
    /// Returns the name used in logs and metrics.
    pub fn instance_name(&self) -> String {
        instance_name("sources", &self.plugin, self.alias.as_deref())
    }
}

/// Configuration of a processor instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Name of the registered processor plugin.
    pub plugin: String,
    /// Distinguishes multiple instances of the same plugin in logs and metrics.
    pub alias: Option<String>,
    /// Position in the processor chain. Lower values run first, ties keep configuration order.
    pub order: i64,
    /// Points not selected by this filter pass through unchanged.
    #[serde(flatten)]
    pub filter: FilterConfig,
    /// Caps the verbosity of this instance's diagnostics.
    pub log_level: Option<Level>,
    /// Plugin-specific options.
    pub options: serde_json::Value,
}

impl ProcessorConfig {
    /// Returns the name used in logs and metrics.
    pub fn instance_name(&self) -> String {
        instance_name("processors", &self.plugin, self.alias.as_deref())
    }
}

/// Configuration of an aggregator instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Name of the registered aggregation plugin.
    pub plugin: String,
    /// Distinguishes multiple instances of the same plugin in logs and metrics.
    pub alias: Option<String>,
    /// Stops original points that this aggregator selected from reaching the sinks.
    ///
    /// Defaults to `false`.
    pub drop_original: bool,
    /// Length of the aggregation window in seconds.
    ///
    /// Defaults to `30` seconds. Must be positive.
    pub period: u64,
    /// Time in seconds after the end of the window during which late points are still admitted.
    ///
    /// Defaults to `0`. The window is pushed only after this delay has passed.
    pub delay: u64,
    /// Time in seconds before the start of the window during which early points are admitted.
    ///
    /// Defaults to `0`.
    pub grace: u64,
    /// Renaming and tags for aggregates.
    #[serde(flatten)]
    pub decorations: Decorations,
    /// Selection of points to aggregate.
    #[serde(flatten)]
    pub filter: FilterConfig,
    /// Caps the verbosity of this instance's diagnostics.
    pub log_level: Option<Level>,
    /// Plugin-specific options.
    pub options: serde_json::Value,
}

impl AggregatorConfig {
    /// Returns the name used in logs and metrics.
    pub fn instance_name(&self) -> String {
        instance_name("aggregators", &self.plugin, self.alias.as_deref())
    }

    pub(crate) fn period(&self) -> Result<TimeDelta, ConfigurationErrorKind> {
        if self.period == 0 {
            return Err(ConfigurationErrorKind::NonPositivePeriod);
        }
        time_delta(self.period, "period")
    }

    pub(crate) fn delay(&self) -> Result<TimeDelta, ConfigurationErrorKind> {
        time_delta(self.delay, "delay")
    }

    pub(crate) fn grace(&self) -> Result<TimeDelta, ConfigurationErrorKind> {
        time_delta(self.grace, "grace")
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            plugin: String::new(),
            alias: None,
            drop_original: false,
            period: 30,
            delay: 0,
            grace: 0,
            decorations: Decorations::default(),
            filter: FilterConfig::default(),
            log_level: None,
            options: serde_json::Value::Null,
        }
    }
}

/// Configuration of a sink instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Name of the registered sink plugin.
    pub plugin: String,
    /// Distinguishes multiple instances of the same plugin in logs and metrics.
    pub alias: Option<String>,
    /// Selection of points written by this sink.
    #[serde(flatten)]
    pub filter: FilterConfig,
    /// Flush interval in seconds. Defaults to the agent flush interval.
    pub flush_interval: Option<u64>,
    /// Maximum flush jitter in seconds. Defaults to the agent flush jitter.
    pub flush_jitter: Option<u64>,
    /// Maximum points per write. Defaults to the agent batch size.
    pub metric_batch_size: Option<usize>,
    /// Maximum buffered points. Defaults to the agent buffer limit.
    pub metric_buffer_limit: Option<usize>,
    /// Caps the verbosity of this instance's diagnostics.
    pub log_level: Option<Level>,
    /// Plugin-specific options.
    pub options: serde_json::Value,
}

impl SinkConfig {
    /// Returns the name used in logs and metrics.
    pub fn instance_name(&self) -> String {
        instance_name("sinks", &self.plugin, self.alias.as_deref())
    }
}

/// Configuration of a complete pipeline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Settings shared by all instances.
    pub agent: AgentConfig,
    /// Source instances.
    pub sources: Vec<SourceConfig>,
    /// Processor instances.
    pub processors: Vec<ProcessorConfig>,
    /// Aggregator instances.
    pub aggregators: Vec<AggregatorConfig>,
    /// Sink instances.
    pub sinks: Vec<SinkConfig>,
}

fn instance_name(kind: &str, plugin: &str, alias: Option<&str>) -> String {
    match alias {
        Some(alias) => format!("{kind}.{plugin}::{alias}"),
        None => format!("{kind}.{plugin}"),
    }
}

fn time_delta(secs: u64, field: &'static str) -> Result<TimeDelta, ConfigurationErrorKind> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or(ConfigurationErrorKind::DurationOutOfRange(field))
}
