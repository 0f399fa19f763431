use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sluice_log::LogConfig;
use sluice_pipeline::PipelineConfig;

/// Controls internal reporting of the pipeline's own metrics to statsd.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Defaults to `None`, which disables metrics.
    pub statsd: Option<String>,
    /// Common prefix that should be added to all metrics.
    ///
    /// Defaults to `"sluice"`.
    pub prefix: String,
    /// Default tags to apply to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Size of the UDP buffer in bytes.
    ///
    /// Defaults to `None`, which uses the client's default.
    pub buffer_size: Option<usize>,
    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    ///
    /// Defaults to `1.0` (100%).
    pub sample_rate: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: "sluice".to_owned(),
            default_tags: BTreeMap::new(),
            buffer_size: None,
            sample_rate: 1.0,
        }
    }
}

/// Complete configuration of a sluice agent.
///
/// The pipeline sections are flattened into the top level, next to `logging` and `metrics`:
///
/// ```json
/// {
///   "logging": {"level": "debug"},
///   "agent": {"interval": 10},
///   "sinks": [{"plugin": "discard"}]
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level and format.
    pub logging: LogConfig,
    /// Reporting of internal metrics.
    pub metrics: Metrics,
    /// Agent settings and plugin instances.
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flattened_pipeline() {
        let config: Config = serde_json::from_str(
            r#"{
                "logging": {"level": "debug"},
                "metrics": {"statsd": "127.0.0.1:8125"},
                "agent": {"interval": 60, "round_interval": false},
                "aggregators": [{"plugin": "sum", "period": 60, "drop_original": true}],
                "sinks": [{"plugin": "discard", "alias": "null"}]
            }"#,
        )
        .unwrap();

        assert_eq!(config.logging.level, sluice_log::Level::Debug);
        assert_eq!(config.metrics.statsd.as_deref(), Some("127.0.0.1:8125"));
        assert_eq!(config.metrics.prefix, "sluice");
        assert_eq!(config.pipeline.agent.interval, 60);
        assert!(!config.pipeline.agent.round_interval);
        assert_eq!(config.pipeline.agent.flush_interval, 10);
        assert!(config.pipeline.aggregators[0].drop_original);
        assert_eq!(config.pipeline.sinks[0].instance_name(), "sinks.discard::null");
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
    }
}
