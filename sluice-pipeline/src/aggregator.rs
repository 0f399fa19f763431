//! Lifecycle and window bookkeeping around an aggregation algorithm.

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use sluice_log::Level;
use sluice_statsd::metric;

use crate::aggregation::{AggregateOutput, Aggregation};
use crate::clock::Clock;
use crate::config::AggregatorConfig;
use crate::error::{ConfigurationError, PushError};
use crate::filter::Filter;
use crate::point::DataPoint;
use crate::statsd::{PipelineCounters, PipelineTimers};
use crate::window::{Admission, AggregationWindow};

/// Lifecycle states of a [`RunningAggregator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregatorState {
    /// Constructed, but settings have not been validated.
    Created,
    /// Settings are valid, no window is open yet.
    Initialized,
    /// A window is open and points are admitted.
    Running,
    /// The final window has been pushed.
    Stopped,
}

/// Counters of a single aggregator instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Aggregate points emitted.
    pub pushed: u64,
    /// Points selected, but left without fields after filtering or rejected by a broken filter.
    pub filtered: u64,
    /// Points outside of the open window or offered while not running.
    pub dropped: u64,
    /// Total time spent in pushes, in nanoseconds.
    pub push_time: u64,
}

#[derive(Debug, Default)]
struct Counters {
    pushed: AtomicU64,
    filtered: AtomicU64,
    dropped: AtomicU64,
    push_time: AtomicU64,
}

struct Inner {
    state: AggregatorState,
    window: Option<AggregationWindow>,
    algorithm: Box<dyn Aggregation>,
}

/// An aggregation algorithm bound to its window, filter and configuration.
///
/// All access to the window and the algorithm goes through one lock per instance, held for
/// exactly one add or push. Points are folded into a copy without tracking, so aggregation never
/// holds up the delivery of the original.
pub struct RunningAggregator {
    name: String,
    config: AggregatorConfig,
    filter: Filter,
    clock: Arc<dyn Clock>,
    period: TimeDelta,
    grace: TimeDelta,
    delay: TimeDelta,
    inner: Mutex<Inner>,
    counters: Counters,
}

impl RunningAggregator {
    /// Wraps an algorithm. The aggregator must be initialized and started before use.
    pub fn new(
        algorithm: Box<dyn Aggregation>,
        config: AggregatorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: config.instance_name(),
            filter: Filter::lazy(config.filter.clone()),
            config,
            clock,
            period: TimeDelta::zero(),
            grace: TimeDelta::zero(),
            delay: TimeDelta::zero(),
            inner: Mutex::new(Inner {
                state: AggregatorState::Created,
                window: None,
                algorithm,
            }),
            counters: Counters::default(),
        }
    }

    /// Validates the configuration, compiles the filter and initializes the algorithm.
    pub fn init(&mut self) -> Result<(), ConfigurationError> {
        self.try_init()
            .map_err(|error| error.with_instance(self.name.as_str()))
    }

    fn try_init(&mut self) -> Result<(), ConfigurationError> {
        self.period = self.config.period()?;
        self.grace = self.config.grace()?;
        self.delay = self.config.delay()?;
        self.filter = Filter::new(self.config.filter.clone())?;

        let inner = self.inner.get_mut();
        inner.algorithm.init()?;
        inner.state = AggregatorState::Initialized;
        Ok(())
    }

    /// Opens the first window at the current time.
    pub fn start(&self) {
        self.open(|now| AggregationWindow::new(now, self.period, self.grace, self.delay));
    }

    /// Opens the first window aligned to a multiple of the period.
    pub fn start_aligned(&self) {
        self.open(|now| AggregationWindow::aligned(now, self.period, self.grace, self.delay));
    }

    fn open(&self, window: impl FnOnce(DateTime<Utc>) -> AggregationWindow) {
        let mut inner = self.inner.lock();
        if inner.state != AggregatorState::Initialized {
            sluice_log::error!(
                aggregator = self.name(),
                state = ?inner.state,
                "aggregator started in invalid state"
            );
            return;
        }

        let window = window(self.clock.now());
        if self.logs(Level::Debug) {
            sluice_log::debug!(
                aggregator = self.name(),
                "opened aggregation window [{}, {})",
                window.start(),
                window.end()
            );
        }

        inner.window = Some(window);
        inner.state = AggregatorState::Running;
    }

    /// Offers a point to this aggregator.
    ///
    /// Returns `true` if the original point must not continue to the sinks. Points that this
    /// aggregator does not select always continue.
    pub fn add(&self, point: &DataPoint) -> bool {
        let drop_original = self.config.drop_original;

        match self.filter.select(point) {
            Ok(true) => (),
            Ok(false) => return false,
            Err(error) => {
                if self.logs(Level::Error) {
                    sluice_log::error!(
                        error = &error as &dyn Error,
                        aggregator = self.name(),
                        "filtering failed"
                    );
                }
                self.count(&self.counters.filtered, PipelineCounters::AggregatorFiltered);
                return drop_original;
            }
        }

        let mut point = point.detached();
        if self.filter.modify(&mut point).is_err() || point.fields.is_empty() {
            self.count(&self.counters.filtered, PipelineCounters::AggregatorFiltered);
            return drop_original;
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let admission = match (inner.state, &inner.window) {
            (AggregatorState::Running, Some(window)) => window.admit(point.timestamp),
            _ => Admission::Reject,
        };

        if admission == Admission::Reject {
            drop(guard);
            if self.logs(Level::Debug) {
                sluice_log::debug!(
                    aggregator = self.name(),
                    timestamp = %point.timestamp,
                    "point outside of aggregation window, discarding"
                );
            }
            self.count(&self.counters.dropped, PipelineCounters::AggregatorDropped);
            return drop_original;
        }

        inner.algorithm.add(&point);
        drop(guard);

        metric!(
            counter(PipelineCounters::AggregatorAdded) += 1,
            aggregator = self.name()
        );
        drop_original
    }

    /// Closes the current window and appends its aggregates to `out`.
    ///
    /// The window advances before the algorithm pushes, so aggregates are stamped with the window
    /// that just closed. The algorithm is reset afterwards in any case. If the algorithm fails,
    /// its partial output is discarded.
    pub fn push(&self, out: &mut Vec<DataPoint>) -> Result<(), PushError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let window = match (inner.state, inner.window.as_mut()) {
            (AggregatorState::Running, Some(window)) => window,
            _ => return Err(PushError::NotRunning),
        };

        let (closed_start, closed_end) = (window.start(), window.end());
        let (start, end) = window.advance(self.clock.now());

        if start != closed_end {
            metric!(
                counter(PipelineCounters::WindowReanchored) += 1,
                aggregator = self.name()
            );
            if self.logs(Level::Warn) {
                sluice_log::warn!(
                    aggregator = self.name(),
                    "clock moved outside of the next window, re-anchored to [{start}, {end})"
                );
            }
        } else if self.logs(Level::Debug) {
            sluice_log::debug!(aggregator = self.name(), "advanced window to [{start}, {end})");
        }

        let mut output = AggregateOutput::new(closed_start, closed_end);
        let started = Instant::now();
        let result = inner.algorithm.push(&mut output);
        let elapsed = started.elapsed();
        inner.algorithm.reset();
        drop(guard);

        self.counters
            .push_time
            .fetch_add(
                u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
                Ordering::Relaxed,
            );
        metric!(
            timer(PipelineTimers::PushDuration) = elapsed,
            aggregator = self.name()
        );

        result?;

        let points = output.into_points();
        let pushed = u64::try_from(points.len()).unwrap_or(u64::MAX);
        out.extend(points.into_iter().map(|mut point| {
            self.config.decorations.apply(&mut point);
            point
        }));

        self.counters.pushed.fetch_add(pushed, Ordering::Relaxed);
        let pushed = i64::try_from(pushed).unwrap_or(i64::MAX);
        metric!(
            counter(PipelineCounters::AggregatorPushed) += pushed,
            aggregator = self.name()
        );

        Ok(())
    }

    /// Pushes the final window and stops admitting points.
    pub fn stop(&self, out: &mut Vec<DataPoint>) -> Result<(), PushError> {
        let result = self.push(out);
        self.inner.lock().state = AggregatorState::Stopped;
        result
    }

    /// Returns the name of this instance used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configuration of this instance.
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> AggregatorState {
        self.inner.lock().state
    }

    /// Returns a copy of the open window.
    pub fn window(&self) -> Option<AggregationWindow> {
        self.inner.lock().window.clone()
    }

    /// Returns the end of the open window, if running.
    pub fn period_end(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().window.as_ref().map(AggregationWindow::end)
    }

    /// Returns the window length.
    pub fn period(&self) -> Duration {
        self.period.to_std().unwrap_or_default()
    }

    /// Returns the time to wait after the end of a window before pushing it.
    pub fn delay(&self) -> Duration {
        self.delay.to_std().unwrap_or_default()
    }

    /// Returns a snapshot of the counters of this instance.
    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            pushed: self.counters.pushed.load(Ordering::Relaxed),
            filtered: self.counters.filtered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            push_time: self.counters.push_time.load(Ordering::Relaxed),
        }
    }

    fn logs(&self, level: Level) -> bool {
        self.config.log_level.is_none_or(|max| max.allows(level))
    }

    fn count(&self, counter: &AtomicU64, metric: PipelineCounters) {
        counter.fetch_add(1, Ordering::Relaxed);
        metric!(counter(metric) += 1, aggregator = self.name());
    }
}

impl std::fmt::Debug for RunningAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningAggregator")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::Sum;
    use crate::clock::ManualClock;
    use crate::filter::FilterConfig;
    use crate::point::{FieldValue, Fields, Tags};
    use crate::tracking::{TrackingRegistry, delivery_channel};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn point(secs: i64, value: i64) -> DataPoint {
        DataPoint::new(
            "requests",
            Tags::from([("host".to_owned(), "a".to_owned())]),
            Fields::from([("value".to_owned(), FieldValue::Int(value))]),
            at(secs),
        )
    }

    fn aggregator(config: AggregatorConfig, clock: &Arc<ManualClock>) -> RunningAggregator {
        let clock: Arc<dyn Clock> = clock.clone();
        let mut aggregator = RunningAggregator::new(Box::new(Sum::default()), config, clock);
        aggregator.init().unwrap();
        aggregator.start();
        aggregator
    }

    fn sum_config() -> AggregatorConfig {
        AggregatorConfig {
            plugin: "sum".to_owned(),
            period: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_push_closed_window() {
        let clock = Arc::new(ManualClock::from_secs(0));
        let aggregator = aggregator(sum_config(), &clock);

        assert!(!aggregator.add(&point(1, 5)));
        assert!(!aggregator.add(&point(9, 7)));

        // Too late for [0, 10) before the window advances.
        aggregator.add(&point(11, 100));
        assert_eq!(aggregator.stats().dropped, 1);

        clock.set(at(10));
        let mut out = Vec::new();
        aggregator.push(&mut out).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fields["value"], FieldValue::Float(12.0));
        assert_eq!(out[0].timestamp, at(0));
        assert_eq!(aggregator.period_end(), Some(at(20)));

        // Accepted into [10, 20) after the advance.
        aggregator.add(&point(11, 1));
        clock.set(at(20));
        out.clear();
        aggregator.push(&mut out).unwrap();
        assert_eq!(out[0].fields["value"], FieldValue::Float(1.0));
        assert_eq!(out[0].timestamp, at(10));

        let stats = aggregator.stats();
        assert_eq!((stats.pushed, stats.dropped, stats.filtered), (2, 1, 0));
    }

    #[test]
    fn test_clock_jump_reanchors_once() {
        let clock = Arc::new(ManualClock::from_secs(90));
        let aggregator = aggregator(sum_config(), &clock);
        aggregator.add(&point(95, 3));

        clock.set(at(500));
        let mut out = Vec::new();
        aggregator.push(&mut out).unwrap();

        // One flush for the window that closed, no catch-up windows.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp, at(90));

        let window = aggregator.window().unwrap();
        assert_eq!((window.start(), window.end()), (at(500), at(510)));
    }

    #[test]
    fn test_drop_original_policy() {
        let clock = Arc::new(ManualClock::from_secs(0));
        let aggregator = aggregator(
            AggregatorConfig {
                drop_original: true,
                filter: FilterConfig {
                    namepass: vec!["requests".to_owned()],
                    ..Default::default()
                },
                ..sum_config()
            },
            &clock,
        );

        // Selected, inside and outside of the window: the policy applies either way.
        assert!(aggregator.add(&point(1, 1)));
        assert!(aggregator.add(&point(1, 1)));
        assert!(aggregator.add(&point(1000, 1)));

        // Not selected: the point always continues.
        let mut other = point(1, 1);
        other.name = "other".to_owned();
        assert!(!aggregator.add(&other));
    }

    #[test]
    fn test_fields_filtered_out() {
        let clock = Arc::new(ManualClock::from_secs(0));
        let aggregator = aggregator(
            AggregatorConfig {
                filter: FilterConfig {
                    fielddrop: vec!["value".to_owned()],
                    ..Default::default()
                },
                ..sum_config()
            },
            &clock,
        );

        assert!(!aggregator.add(&point(1, 1)));
        assert_eq!(aggregator.stats().filtered, 1);
    }

    #[test]
    fn test_add_keeps_tracking_of_original() {
        let clock = Arc::new(ManualClock::from_secs(0));
        let aggregator = aggregator(sum_config(), &clock);

        let registry = TrackingRegistry::new();
        let (notifier, _rx) = delivery_channel();
        let (id, tracked) = registry.track(point(1, 1), &notifier);

        aggregator.add(&tracked);
        assert_eq!(tracked.tracking_id(), Some(id));

        clock.set(at(10));
        let mut out = Vec::new();
        aggregator.push(&mut out).unwrap();
        assert!(!out[0].is_tracked());
        assert_eq!(registry.pending(), 1);
    }

    #[test]
    fn test_decorations() {
        let clock = Arc::new(ManualClock::from_secs(0));
        let mut config = sum_config();
        config.decorations.name_override = Some("total".to_owned());
        config.decorations.measurement_suffix = Some("_10s".to_owned());
        config.decorations.tags = Tags::from([("agg".to_owned(), "sum".to_owned())]);
        let aggregator = aggregator(config, &clock);

        aggregator.add(&point(1, 1));
        clock.set(at(10));
        let mut out = Vec::new();
        aggregator.push(&mut out).unwrap();

        assert_eq!(out[0].name, "total_10s");
        assert_eq!(out[0].tags.len(), 2);
    }

    #[test]
    fn test_invalid_period() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::from_secs(0));
        let mut aggregator = RunningAggregator::new(
            Box::new(Sum::default()),
            AggregatorConfig {
                period: 0,
                ..sum_config()
            },
            clock,
        );

        let error = aggregator.init().unwrap_err();
        assert_eq!(error.instance(), Some("aggregators.sum"));
        assert_eq!(aggregator.state(), AggregatorState::Created);
    }

    #[test]
    fn test_add_before_start_and_after_stop() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::from_secs(0));
        let mut aggregator = RunningAggregator::new(Box::new(Sum::default()), sum_config(), clock);
        aggregator.init().unwrap();

        assert!(!aggregator.add(&point(1, 1)));
        assert!(matches!(
            aggregator.push(&mut Vec::new()),
            Err(PushError::NotRunning)
        ));

        aggregator.start();
        aggregator.stop(&mut Vec::new()).unwrap();
        assert_eq!(aggregator.state(), AggregatorState::Stopped);

        aggregator.add(&point(1, 1));
        assert_eq!(aggregator.stats().dropped, 2);
    }

    /// Counts added points and fails the first `failures` pushes.
    #[derive(Debug, Default)]
    struct Flaky {
        added: usize,
        failures: usize,
    }

    impl Aggregation for Flaky {
        fn add(&mut self, _point: &DataPoint) {
            self.added += 1;
        }

        fn push(&mut self, out: &mut AggregateOutput) -> Result<(), PushError> {
            out.add_fields(
                "partial",
                Tags::new(),
                Fields::from([("n".to_owned(), FieldValue::Uint(self.added as u64))]),
            );

            if self.failures > 0 {
                self.failures -= 1;
                return Err(PushError::aggregation("backend unavailable"));
            }
            Ok(())
        }

        fn reset(&mut self) {
            self.added = 0;
        }
    }

    fn flaky(failures: usize, clock: &Arc<ManualClock>) -> RunningAggregator {
        let clock: Arc<dyn Clock> = clock.clone();
        let algorithm = Flaky {
            failures,
            ..Default::default()
        };
        let mut aggregator = RunningAggregator::new(Box::new(algorithm), sum_config(), clock);
        aggregator.init().unwrap();
        aggregator.start();
        aggregator
    }

    /// Adds one point to the window [10, 20) and pushes it.
    fn second_window(aggregator: &RunningAggregator, clock: &ManualClock) -> Vec<DataPoint> {
        assert!(!aggregator.add(&point(11, 1)));
        clock.set(at(20));
        let mut out = Vec::new();
        aggregator.push(&mut out).unwrap();
        out
    }

    #[test]
    fn test_failed_push_still_resets() {
        let clock = Arc::new(ManualClock::from_secs(0));
        let aggregator = flaky(1, &clock);

        aggregator.add(&point(1, 1));
        aggregator.add(&point(2, 1));
        clock.set(at(10));

        let mut out = Vec::new();
        assert!(aggregator.push(&mut out).is_err());
        assert!(out.is_empty());
        assert_eq!(aggregator.period_end(), Some(at(20)));

        let out = second_window(&aggregator, &clock);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fields["n"], FieldValue::Uint(1));

        let fresh_clock = Arc::new(ManualClock::from_secs(10));
        let fresh = flaky(0, &fresh_clock);
        similar_asserts::assert_eq!(out, second_window(&fresh, &fresh_clock));
    }

    #[test]
    fn test_successful_push_resets() {
        let clock = Arc::new(ManualClock::from_secs(0));
        let used = aggregator(sum_config(), &clock);

        used.add(&point(1, 5));
        used.add(&point(2, 7));
        clock.set(at(10));
        let mut out = Vec::new();
        used.push(&mut out).unwrap();
        assert_eq!(out[0].fields["value"], FieldValue::Float(12.0));

        let fresh_clock = Arc::new(ManualClock::from_secs(10));
        let fresh = aggregator(sum_config(), &fresh_clock);

        similar_asserts::assert_eq!(
            second_window(&used, &clock),
            second_window(&fresh, &fresh_clock)
        );
    }

    #[test]
    fn test_push_metrics() {
        let clock = Arc::new(ManualClock::from_secs(0));
        let aggregator = aggregator(sum_config(), &clock);
        aggregator.add(&point(1, 1));
        clock.set(at(10));

        let captures = sluice_statsd::with_capturing_test_client(|| {
            aggregator.push(&mut Vec::new()).unwrap();
        });

        assert_eq!(captures.len(), 2);
        assert!(captures[0].starts_with("pipeline.aggregator.push_duration:"));
        assert_eq!(
            captures[1],
            "pipeline.aggregator.pushed:1|c|#aggregator:aggregators.sum"
        );
    }
}
