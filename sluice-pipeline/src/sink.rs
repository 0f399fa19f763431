//! Buffered output of points to sink adapters.

use std::collections::VecDeque;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use sluice_log::Level;
use sluice_statsd::metric;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::config::{AgentConfig, SinkConfig};
use crate::error::{ConfigurationError, PushError, SinkError};
use crate::filter::Filter;
use crate::point::DataPoint;
use crate::statsd::{PipelineCounters, PipelineDistributions, PipelineGauges, PipelineTimers};
use crate::tracking::TrackingRegistry;

/// A terminal output of the pipeline.
///
/// A successful write means the sink durably accepted every point of the batch. Outcomes are
/// reported to the tracking registry by [`RunningSink`], adapters never see tracking.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Validates the sink's own settings.
    fn init(&mut self) -> Result<(), ConfigurationError> {
        Ok(())
    }

    /// Establishes the connection before the first write.
    async fn connect(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Writes one batch of points.
    async fn write(&mut self, points: &[DataPoint]) -> Result<(), SinkError>;

    /// Releases the connection after the final write.
    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// A sink that accepts and forgets every point.
#[derive(Debug, Default)]
pub struct DiscardSink;

#[async_trait]
impl Sink for DiscardSink {
    async fn write(&mut self, _points: &[DataPoint]) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Counters of a [`RunningSink`] since it was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Points written successfully.
    pub written: u64,
    /// Points evicted from a full buffer.
    pub dropped: u64,
    /// Failed batch writes.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// A sink adapter with its filter and output buffer.
///
/// The router adds points concurrently with the flush task. Points are written in batches of
/// `metric_batch_size`. A batch that fails to write returns to the front of the buffer and is
/// retried on the next flush. When the buffer exceeds `metric_buffer_limit`, the oldest points are
/// evicted and reported as undelivered.
pub struct RunningSink {
    name: String,
    config: SinkConfig,
    filter: Filter,
    batch_size: usize,
    buffer_limit: usize,
    buffer: Mutex<VecDeque<DataPoint>>,
    output: AsyncMutex<Box<dyn Sink>>,
    registry: Arc<TrackingRegistry>,
    batch_ready: Notify,
    counters: Counters,
}

impl RunningSink {
    /// Wraps a sink adapter. It must be initialized before use.
    pub fn new(sink: Box<dyn Sink>, config: SinkConfig, registry: Arc<TrackingRegistry>) -> Self {
        let agent = AgentConfig::default();
        Self {
            name: config.instance_name(),
            filter: Filter::lazy(config.filter.clone()),
            batch_size: config.metric_batch_size.unwrap_or(agent.metric_batch_size),
            buffer_limit: config.metric_buffer_limit.unwrap_or(agent.metric_buffer_limit),
            config,
            buffer: Mutex::new(VecDeque::new()),
            output: AsyncMutex::new(sink),
            registry,
            batch_ready: Notify::new(),
            counters: Counters::default(),
        }
    }

    /// Resolves buffer settings against the agent defaults, compiles the filter and initializes
    /// the adapter.
    pub fn init(&mut self, agent: &AgentConfig) -> Result<(), ConfigurationError> {
        self.try_init(agent)
            .map_err(|error| error.with_instance(self.name.as_str()))
    }

    fn try_init(&mut self, agent: &AgentConfig) -> Result<(), ConfigurationError> {
        self.batch_size = self
            .config
            .metric_batch_size
            .unwrap_or(agent.metric_batch_size);
        self.buffer_limit = self
            .config
            .metric_buffer_limit
            .unwrap_or(agent.metric_buffer_limit);

        if self.flush_interval(agent).is_zero() {
            return Err(ConfigurationError::invalid("flush_interval must be positive"));
        }
        if self.batch_size == 0 {
            return Err(ConfigurationError::invalid(
                "metric_batch_size must be positive",
            ));
        }
        if self.buffer_limit < self.batch_size {
            return Err(ConfigurationError::invalid(format!(
                "metric_buffer_limit {} is smaller than metric_batch_size {}",
                self.buffer_limit, self.batch_size
            )));
        }

        self.filter = Filter::new(self.config.filter.clone())?;
        self.output.get_mut().init()
    }

    /// Returns the name of this instance used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configuration of this instance.
    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Returns the flush interval, falling back to the agent's interval.
    pub fn flush_interval(&self, agent: &AgentConfig) -> Duration {
        self.config
            .flush_interval
            .map(Duration::from_secs)
            .unwrap_or_else(|| agent.flush_interval())
    }

    /// Returns the maximum random delay added to each flush.
    pub fn flush_jitter(&self, agent: &AgentConfig) -> Duration {
        self.config
            .flush_jitter
            .map(Duration::from_secs)
            .unwrap_or_else(|| agent.flush_jitter())
    }

    /// Connects the adapter.
    pub async fn connect(&self) -> Result<(), SinkError> {
        self.output.lock().await.connect().await
    }

    /// Returns `true` if this sink wants the point.
    pub fn select(&self, point: &DataPoint) -> bool {
        match self.filter.select(point) {
            Ok(selected) => selected,
            Err(error) => {
                if self.logs(Level::Error) {
                    sluice_log::error!(
                        error = &error as &dyn Error,
                        sink = self.name(),
                        "filtering failed"
                    );
                }
                false
            }
        }
    }

    /// Buffers a selected point for the next flush.
    ///
    /// A point left without fields by the filter counts as delivered.
    pub fn add(&self, mut point: DataPoint) {
        if self.filter.modify(&mut point).is_err() || point.fields.is_empty() {
            self.report(&point, true);
            return;
        }

        let (evicted, buffered) = {
            let mut buffer = self.buffer.lock();
            buffer.push_back(point);
            let evicted = evict(&mut buffer, self.buffer_limit);
            (evicted, buffer.len())
        };

        self.dropped(evicted);
        metric!(
            gauge(PipelineGauges::SinkBuffered) = buffered as u64,
            sink = self.name()
        );

        if buffered >= self.batch_size {
            self.batch_ready.notify_one();
        }
    }

    /// Resolves once the buffer holds a full batch.
    pub async fn batch_ready(&self) {
        self.batch_ready.notified().await
    }

    /// Returns the number of buffered points.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Writes all points buffered at the time of the call.
    ///
    /// Stops at the first failing batch, which is returned to the front of the buffer.
    pub async fn flush(&self) -> Result<(), PushError> {
        let mut output = self.output.lock().await;

        let batches = self.buffered().div_ceil(self.batch_size);
        for _ in 0..batches {
            let batch: Vec<DataPoint> = {
                let mut buffer = self.buffer.lock();
                let len = buffer.len().min(self.batch_size);
                buffer.drain(..len).collect()
            };

            if batch.is_empty() {
                break;
            }

            metric!(
                distribution(PipelineDistributions::BatchSize) = batch.len() as u64,
                sink = self.name()
            );

            let started = Instant::now();
            let result = output.write(&batch).await;
            metric!(
                timer(PipelineTimers::WriteDuration) = started.elapsed(),
                sink = self.name()
            );

            match result {
                Ok(()) => {
                    for point in &batch {
                        self.report(point, true);
                    }
                    self.counters
                        .written
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    metric!(
                        counter(PipelineCounters::SinkWritten) += batch.len() as i64,
                        sink = self.name()
                    );
                }
                Err(error) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    metric!(
                        counter(PipelineCounters::SinkFailed) += 1,
                        sink = self.name()
                    );
                    self.requeue(batch);

                    return Err(PushError::Sink {
                        sink: self.name.clone(),
                        source: error,
                    });
                }
            }
        }

        metric!(
            gauge(PipelineGauges::SinkBuffered) = self.buffered() as u64,
            sink = self.name()
        );

        Ok(())
    }

    /// Flushes the remaining points and closes the adapter.
    ///
    /// Points that could not be written are reported as undelivered.
    pub async fn close(&self) -> Result<(), PushError> {
        let result = self.flush().await;

        if let Err(error) = self.output.lock().await.close().await {
            if self.logs(Level::Warn) {
                sluice_log::warn!(
                    error = &error as &dyn Error,
                    sink = self.name(),
                    "failed to close sink"
                );
            }
        }

        let remaining: Vec<DataPoint> = self.buffer.lock().drain(..).collect();
        for point in &remaining {
            self.report(point, false);
        }

        result
    }

    /// Returns a snapshot of the counters of this instance.
    pub fn stats(&self) -> SinkStats {
        SinkStats {
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn requeue(&self, batch: Vec<DataPoint>) {
        let evicted = {
            let mut buffer = self.buffer.lock();
            for point in batch.into_iter().rev() {
                buffer.push_front(point);
            }
            evict(&mut buffer, self.buffer_limit)
        };
        self.dropped(evicted);
    }

    fn dropped(&self, evicted: Vec<DataPoint>) {
        if evicted.is_empty() {
            return;
        }

        if self.logs(Level::Warn) {
            sluice_log::warn!(
                sink = self.name(),
                count = evicted.len(),
                "sink buffer full, dropping oldest points"
            );
        }

        for point in &evicted {
            self.report(point, false);
        }

        self.counters
            .dropped
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        metric!(
            counter(PipelineCounters::SinkDropped) += evicted.len() as i64,
            sink = self.name()
        );
    }

    fn report(&self, point: &DataPoint, success: bool) {
        if let Some(id) = point.tracking_id() {
            // Violations are logged and counted by the registry.
            let _ = self.registry.report_outcome(id, success);
        }
    }

    fn logs(&self, level: Level) -> bool {
        self.config.log_level.is_none_or(|max| max.allows(level))
    }
}

impl std::fmt::Debug for RunningSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningSink")
            .field("name", &self.name)
            .field("batch_size", &self.batch_size)
            .field("buffer_limit", &self.buffer_limit)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Removes points from the front until the buffer fits into `limit`.
fn evict(buffer: &mut VecDeque<DataPoint>, limit: usize) -> Vec<DataPoint> {
    let excess = buffer.len().saturating_sub(limit);
    buffer.drain(..excess).collect()
}
