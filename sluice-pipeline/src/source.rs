use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sluice_statsd::metric;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::accumulator::Accumulator;
use crate::clock::Clock;
use crate::config::{AgentConfig, SourceConfig};
use crate::error::{CollectionError, ConfigurationError};
use crate::filter::Filter;
use crate::point::DataPoint;
use crate::statsd::PipelineTimers;
use crate::tracking::TrackingRegistry;

/// A collection plugin.
///
/// Sources are invoked once per interval. They report points and partial failures through the
/// accumulator and should return early when its [cancellation token](Accumulator::cancellation)
/// fires.
#[async_trait]
pub trait Source: Send + Sync {
    /// Validates the source's own settings.
    fn init(&mut self) -> Result<(), ConfigurationError> {
        Ok(())
    }

    /// Runs one collection cycle.
    async fn gather(&self, acc: &Accumulator) -> Result<(), CollectionError>;
}

/// A source bound to its configuration.
pub struct RunningSource {
    name: String,
    config: SourceConfig,
    filter: Filter,
    source: Box<dyn Source>,
}

impl RunningSource {
    /// Wraps a source. It must be initialized before use.
    pub fn new(source: Box<dyn Source>, config: SourceConfig) -> Self {
        Self {
            name: config.instance_name(),
            filter: Filter::lazy(config.filter.clone()),
            config,
            source,
        }
    }

    /// Validates the interval, compiles the filter and initializes the source.
    pub fn init(&mut self, agent: &AgentConfig) -> Result<(), ConfigurationError> {
        self.try_init(agent)
            .map_err(|error| error.with_instance(self.name.as_str()))
    }

    fn try_init(&mut self, agent: &AgentConfig) -> Result<(), ConfigurationError> {
        if self.interval(agent.interval()).is_zero() {
            return Err(ConfigurationError::invalid("interval must be positive"));
        }

        self.filter = Filter::new(self.config.filter.clone())?;
        self.source.init()
    }

    /// Returns the name of this instance used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configuration of this instance.
    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Returns the collection interval, falling back to the agent's interval.
    pub fn interval(&self, default: Duration) -> Duration {
        self.config
            .interval
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Creates the accumulator for collection cycles of this source.
    pub fn accumulator(
        &self,
        clock: Arc<dyn Clock>,
        registry: Arc<TrackingRegistry>,
        tx: mpsc::UnboundedSender<DataPoint>,
        cancel: CancellationToken,
    ) -> Accumulator {
        Accumulator::new(&self.config, clock, registry, tx)
            .with_filter(self.filter.clone())
            .with_cancellation(cancel)
    }

    /// Runs one collection cycle, reporting a failure through the accumulator.
    pub async fn gather(&self, acc: &Accumulator) {
        let started = Instant::now();
        let result = self.source.gather(acc).await;
        metric!(
            timer(PipelineTimers::GatherDuration) = started.elapsed(),
            source = self.name()
        );

        if let Err(error) = result {
            acc.add_error(error);
        }
    }
}

impl std::fmt::Debug for RunningSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningSource")
            .field("name", &self.name)
            .field("interval", &self.config.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::point::{FieldValue, Fields, Tags};

    struct Static;

    #[async_trait]
    impl Source for Static {
        async fn gather(&self, acc: &Accumulator) -> Result<(), CollectionError> {
            let fields = Fields::from([("value".to_owned(), FieldValue::Float(0.5))]);
            acc.add_fields("load", fields, Tags::new(), None);
            Err(CollectionError::target("node-1", "connection refused"))
        }
    }

    fn running(config: SourceConfig) -> RunningSource {
        let mut source = RunningSource::new(Box::new(Static), config);
        source.init(&AgentConfig::default()).unwrap();
        source
    }

    #[test]
    fn test_interval_override() {
        let default = Duration::from_secs(10);

        let source = running(SourceConfig::default());
        assert_eq!(source.interval(default), default);

        let source = running(SourceConfig {
            interval: Some(60),
            ..Default::default()
        });
        assert_eq!(source.interval(default), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut source = RunningSource::new(
            Box::new(Static),
            SourceConfig {
                plugin: "static".to_owned(),
                interval: Some(0),
                ..Default::default()
            },
        );

        let error = source.init(&AgentConfig::default()).unwrap_err();
        assert_eq!(error.instance(), Some("sources.static"));
    }

    #[test]
    fn test_gather_keeps_points_of_failed_cycle() {
        let source = running(SourceConfig {
            plugin: "static".to_owned(),
            ..Default::default()
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let acc = source.accumulator(
            Arc::new(ManualClock::from_secs(5)),
            Arc::new(TrackingRegistry::new()),
            tx,
            CancellationToken::new(),
        );

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let captures = sluice_statsd::with_capturing_test_client(|| {
            rt.block_on(source.gather(&acc));
        });

        let point = rx.try_recv().unwrap();
        assert_eq!(point.name, "load");
        assert!(
            captures.contains(&"pipeline.source.failed:1|c|#source:sources.static".to_owned()),
            "{captures:?}"
        );
    }
}
