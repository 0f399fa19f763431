//! Construction and execution of a complete pipeline.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use sluice_system::{ShutdownHandle, TaskId};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::accumulator::Accumulator;
use crate::aggregator::RunningAggregator;
use crate::clock::Clock;
use crate::config::{AgentConfig, PipelineConfig};
use crate::error::ConfigurationError;
use crate::point::DataPoint;
use crate::processor::RunningProcessor;
use crate::registry::PluginRegistry;
use crate::router::Router;
use crate::sink::RunningSink;
use crate::source::RunningSource;
use crate::tracking::TrackingRegistry;

/// All initialized plugin instances of a pipeline.
#[derive(Debug)]
pub struct Pipeline {
    agent: AgentConfig,
    clock: Arc<dyn Clock>,
    tracking: Arc<TrackingRegistry>,
    sources: Vec<RunningSource>,
    processors: Vec<RunningProcessor>,
    aggregators: Vec<Arc<RunningAggregator>>,
    sinks: Vec<Arc<RunningSink>>,
}

impl Pipeline {
    /// Creates and initializes every configured instance.
    ///
    /// Instances that fail to initialize are skipped. Their errors are returned alongside the
    /// pipeline, which runs with the remaining instances.
    pub fn from_config(
        config: &PipelineConfig,
        plugins: &PluginRegistry,
        clock: Arc<dyn Clock>,
    ) -> (Self, Vec<ConfigurationError>) {
        let agent = config.agent.clone();
        let tracking = Arc::new(TrackingRegistry::new());
        let mut errors = Vec::new();

        let sources = collect(
            config.sources.iter().map(|config| -> Result<_, ConfigurationError> {
                let source = plugins
                    .source(&config.plugin, config.options.clone())
                    .map_err(|error| error.with_instance(config.instance_name()))?;
                let mut running = RunningSource::new(source, config.clone());
                running.init(&agent)?;
                Ok(running)
            }),
            &mut errors,
        );

        let processors = collect(
            config.processors.iter().map(|config| -> Result<_, ConfigurationError> {
                let processor = plugins
                    .processor(&config.plugin, config.options.clone())
                    .map_err(|error| error.with_instance(config.instance_name()))?;
                let mut running = RunningProcessor::new(processor, config.clone());
                running.init()?;
                Ok(running)
            }),
            &mut errors,
        );

        let aggregators = collect(
            config.aggregators.iter().map(|config| -> Result<_, ConfigurationError> {
                let aggregation = plugins
                    .aggregation(&config.plugin, config.options.clone())
                    .map_err(|error| error.with_instance(config.instance_name()))?;
                let mut running =
                    RunningAggregator::new(aggregation, config.clone(), Arc::clone(&clock));
                running.init()?;
                Ok(Arc::new(running))
            }),
            &mut errors,
        );

        let sinks = collect(
            config.sinks.iter().map(|config| -> Result<_, ConfigurationError> {
                let sink = plugins
                    .sink(&config.plugin, config.options.clone())
                    .map_err(|error| error.with_instance(config.instance_name()))?;
                let mut running = RunningSink::new(sink, config.clone(), Arc::clone(&tracking));
                running.init(&agent)?;
                Ok(Arc::new(running))
            }),
            &mut errors,
        );

        for error in &errors {
            sluice_log::error!(
                error = error as &dyn Error,
                "plugin instance failed to initialize, skipping"
            );
        }

        let pipeline = Self {
            agent,
            clock,
            tracking,
            sources,
            processors,
            aggregators,
            sinks,
        };

        (pipeline, errors)
    }

    /// Returns the agent-wide settings.
    pub fn agent(&self) -> &AgentConfig {
        &self.agent
    }

    /// Returns the registry tracking delivery of points in this pipeline.
    pub fn tracking(&self) -> &Arc<TrackingRegistry> {
        &self.tracking
    }

    /// Returns the initialized sources.
    pub fn sources(&self) -> &[RunningSource] {
        &self.sources
    }

    /// Returns the initialized processors.
    pub fn processors(&self) -> &[RunningProcessor] {
        &self.processors
    }

    /// Returns the initialized aggregators.
    pub fn aggregators(&self) -> &[Arc<RunningAggregator>] {
        &self.aggregators
    }

    /// Returns the initialized sinks.
    pub fn sinks(&self) -> &[Arc<RunningSink>] {
        &self.sinks
    }
}

fn collect<T>(
    results: impl Iterator<Item = Result<T, ConfigurationError>>,
    errors: &mut Vec<ConfigurationError>,
) -> Vec<T> {
    let mut instances = Vec::new();
    for result in results {
        match result {
            Ok(instance) => instances.push(instance),
            Err(error) => errors.push(error),
        }
    }
    instances
}

/// Drives a [`Pipeline`] until shutdown.
///
/// Every instance runs in its own task:
///  - one collection task per source, ticking on the source's interval,
///  - one router task moving points to aggregators and sinks,
///  - one push task per aggregator, waking at the end of each window plus its delay,
///  - one flush task per sink, waking on the flush interval or when a batch is ready.
///
/// A failing cycle is logged and counted, and the instance retries on its next tick. On shutdown
/// sources stop first, then the router drains, aggregators push their final window and sinks
/// flush and close. The sequence is bounded by the shutdown timeout.
#[derive(Debug)]
pub struct Scheduler {
    pipeline: Pipeline,
}

impl Scheduler {
    /// Creates a scheduler for the pipeline.
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Runs the pipeline until `shutdown` is notified and the pipeline has drained.
    pub async fn run(self, mut shutdown: ShutdownHandle) {
        let Pipeline {
            agent,
            clock,
            tracking,
            sources,
            processors,
            aggregators,
            sinks,
        } = self.pipeline;

        sluice_log::info!(
            sources = sources.len(),
            processors = processors.len(),
            aggregators = aggregators.len(),
            sinks = sinks.len(),
            "starting pipeline"
        );

        for sink in &sinks {
            if let Err(error) = sink.connect().await {
                sluice_log::error!(
                    error = &error as &dyn Error,
                    sink = sink.name(),
                    "failed to connect sink"
                );
            }
        }

        for aggregator in &aggregators {
            if agent.round_interval {
                aggregator.start_aligned();
            } else {
                aggregator.start();
            }
        }

        let mut abort_handles: Vec<AbortHandle> = Vec::new();
        let (point_tx, point_rx) = mpsc::unbounded_channel();
        let (aggregate_tx, aggregate_rx) = mpsc::unbounded_channel();

        let sink_cancel = CancellationToken::new();
        let sink_tasks: Vec<JoinHandle<()>> = sinks
            .iter()
            .map(|sink| {
                let task = flush_loop(Arc::clone(sink), agent.clone(), sink_cancel.clone());
                sluice_system::spawn(TaskId::named("sink"), task)
            })
            .collect();
        abort_handles.extend(sink_tasks.iter().map(JoinHandle::abort_handle));

        let router = Router::new(
            processors,
            aggregators.clone(),
            sinks.clone(),
            Arc::clone(&tracking),
        );
        let router_task = sluice_system::spawn(
            TaskId::named("router"),
            route_loop(router, point_rx, aggregate_rx),
        );
        abort_handles.push(router_task.abort_handle());

        let push_cancel = CancellationToken::new();
        let push_tasks: Vec<JoinHandle<()>> = aggregators
            .iter()
            .map(|aggregator| {
                let task = push_loop(
                    Arc::clone(aggregator),
                    Arc::clone(&clock),
                    aggregate_tx.clone(),
                    push_cancel.clone(),
                );
                sluice_system::spawn(TaskId::named("aggregator"), task)
            })
            .collect();
        abort_handles.extend(push_tasks.iter().map(JoinHandle::abort_handle));
        drop(aggregate_tx);

        let source_cancel = CancellationToken::new();
        let source_tasks: Vec<JoinHandle<()>> = sources
            .into_iter()
            .map(|source| {
                let acc = source.accumulator(
                    Arc::clone(&clock),
                    Arc::clone(&tracking),
                    point_tx.clone(),
                    source_cancel.clone(),
                );
                let task = collect_loop(source, acc, agent.clone(), Arc::clone(&clock));
                sluice_system::spawn(TaskId::named("source"), task)
            })
            .collect();
        abort_handles.extend(source_tasks.iter().map(JoinHandle::abort_handle));
        drop(point_tx);

        let request = shutdown.notified().await;

        let drain = async {
            source_cancel.cancel();
            join_all(source_tasks).await;

            push_cancel.cancel();
            join_all(push_tasks).await;

            let mut aggregates = Vec::new();
            for aggregator in &aggregators {
                if let Err(error) = aggregator.stop(&mut aggregates) {
                    sluice_log::error!(
                        error = &error as &dyn Error,
                        aggregator = aggregator.name(),
                        "failed to push final aggregates"
                    );
                }
            }

            match router_task.await {
                Ok(router) => router.route_aggregated(aggregates),
                Err(error) => sluice_log::error!(
                    error = &error as &dyn Error,
                    "router task failed, dropping final aggregates"
                ),
            }

            sink_cancel.cancel();
            join_all(sink_tasks).await;

            for sink in &sinks {
                if let Err(error) = sink.close().await {
                    sluice_log::error!(
                        error = &error as &dyn Error,
                        sink = sink.name(),
                        "failed to flush sink on shutdown"
                    );
                }
            }
        };

        let drained = match request.timeout {
            Some(timeout) => {
                let timeout = timeout.min(agent.shutdown_timeout());
                tokio::time::timeout(timeout, drain).await.is_ok()
            }
            None => false,
        };

        if drained {
            sluice_log::info!("pipeline stopped");
        } else {
            sluice_log::warn!("pipeline did not drain in time, aborting remaining tasks");
            for handle in abort_handles {
                handle.abort();
            }
        }
    }
}

/// Collects from a source on every tick until cancelled.
async fn collect_loop(
    source: RunningSource,
    acc: Accumulator,
    agent: AgentConfig,
    clock: Arc<dyn Clock>,
) {
    let interval = source.interval(agent.interval());
    let offset = if agent.round_interval {
        until_aligned(clock.now(), interval)
    } else {
        Duration::ZERO
    };

    let mut ticker = tokio::time::interval_at(Instant::now() + offset, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let cancel = acc.cancellation().clone();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => (),
        }

        let jitter = jitter(agent.collection_jitter());
        if !jitter.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(jitter) => (),
            }
        }

        source.gather(&acc).await;
    }

    sluice_log::debug!(source = source.name(), "source stopped");
}

/// Moves points until all sources and push tasks are gone, then returns the router for the final
/// aggregates.
async fn route_loop(
    mut router: Router,
    mut points: mpsc::UnboundedReceiver<DataPoint>,
    mut aggregates: mpsc::UnboundedReceiver<Vec<DataPoint>>,
) -> Router {
    loop {
        tokio::select! {
            biased;
            Some(batch) = aggregates.recv() => router.route_aggregated(batch),
            Some(point) = points.recv() => router.route(point),
            else => break,
        }
    }

    router
}

/// Pushes an aggregator at the end of every window until cancelled.
///
/// A push that has started always completes.
async fn push_loop(
    aggregator: Arc<RunningAggregator>,
    clock: Arc<dyn Clock>,
    tx: mpsc::UnboundedSender<Vec<DataPoint>>,
    cancel: CancellationToken,
) {
    while let Some(end) = aggregator.period_end() {
        let until_end = (end - clock.now()).to_std().unwrap_or_default();
        let wait = until_end + aggregator.delay();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => (),
        }

        let mut out = Vec::new();
        if let Err(error) = aggregator.push(&mut out) {
            sluice_log::error!(
                error = &error as &dyn Error,
                aggregator = aggregator.name(),
                "failed to push aggregates"
            );
        }

        if !out.is_empty() && tx.send(out).is_err() {
            break;
        }
    }
}

/// Flushes a sink periodically and whenever a full batch is buffered, until cancelled.
async fn flush_loop(sink: Arc<RunningSink>, agent: AgentConfig, cancel: CancellationToken) {
    let interval = sink.flush_interval(&agent);
    let max_jitter = sink.flush_jitter(&agent);

    loop {
        let wait = interval + jitter(max_jitter);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => (),
            _ = sink.batch_ready() => (),
        }

        if let Err(error) = sink.flush().await {
            sluice_log::error!(
                error = &error as &dyn Error,
                sink = sink.name(),
                "failed to write batch, retrying on next flush"
            );
        }
    }
}

/// Returns the time until the next multiple of `interval` since the Unix epoch.
fn until_aligned(now: DateTime<Utc>, interval: Duration) -> Duration {
    let interval = interval.as_nanos() as i128;
    if interval == 0 {
        return Duration::ZERO;
    }

    let now =
        i128::from(now.timestamp()) * 1_000_000_000 + i128::from(now.timestamp_subsec_nanos());
    let remaining = match now.rem_euclid(interval) {
        0 => 0,
        elapsed => interval - elapsed,
    };

    Duration::from_nanos(u64::try_from(remaining).unwrap_or(u64::MAX))
}

/// Returns a random duration below `max`.
fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    rand::rng().random_range(Duration::ZERO..max)
}
