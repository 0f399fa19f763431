//! The entry point of collected points into the pipeline.

use std::error::Error;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sluice_log::Level;
use sluice_statsd::metric;
use tokio::sync::{Mutex as AsyncMutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::{Decorations, SourceConfig};
use crate::error::CollectionError;
use crate::filter::Filter;
use crate::point::{DataPoint, Fields, Tags};
use crate::statsd::PipelineCounters;
use crate::tracking::{DeliveryInfo, DeliveryNotifier, TrackingId, TrackingRegistry};

/// Collects points and errors from a single source.
///
/// The accumulator applies the source's filter and decorations before points enter the router.
/// Points without fields are dropped. Errors are logged and counted, and never abort the
/// collection cycle.
///
/// Cloning is cheap enough to hand one clone to each fan-out target.
#[derive(Clone, Debug)]
pub struct Accumulator {
    source: Arc<str>,
    decorations: Arc<Decorations>,
    filter: Filter,
    log_level: Option<Level>,
    clock: Arc<dyn Clock>,
    registry: Arc<TrackingRegistry>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<DataPoint>,
}

impl Accumulator {
    /// Creates an accumulator for a source that sends accepted points to `tx`.
    pub fn new(
        config: &SourceConfig,
        clock: Arc<dyn Clock>,
        registry: Arc<TrackingRegistry>,
        tx: mpsc::UnboundedSender<DataPoint>,
    ) -> Self {
        Self {
            source: config.instance_name().into(),
            decorations: Arc::new(config.decorations.clone()),
            filter: Filter::lazy(config.filter.clone()),
            log_level: config.log_level,
            clock,
            registry,
            cancel: CancellationToken::new(),
            tx,
        }
    }

    pub(crate) fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub(crate) fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the name of the source this accumulator collects for.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the token that is cancelled when the running collection cycle must stop.
    ///
    /// Sources that fan out to many targets pass this to [`FanOut`](crate::FanOut).
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Adds a measurement.
    ///
    /// Without a timestamp, the point is stamped with the current time.
    pub fn add_fields(
        &self,
        name: impl Into<String>,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
    ) {
        let timestamp = timestamp.unwrap_or_else(|| self.clock.now());
        self.add_point(DataPoint::new(name, tags, fields, timestamp));
    }

    /// Adds a complete point.
    ///
    /// A tracked point that is discarded here resolves immediately: as delivered if the filter
    /// drops it, as failed if the router is gone.
    pub fn add_point(&self, point: DataPoint) {
        let id = point.tracking_id();

        let Some(point) = self.prepare(point) else {
            if let Some(id) = id {
                let _ = self.registry.register_obligations(id, 0);
            }
            return;
        };

        if let (Some(_), Some(id)) = (self.forward(point), id) {
            let _ = self.registry.register_obligations(id, 1);
            let _ = self.registry.report_outcome(id, false);
        }
    }

    /// Reports a failure of the current collection cycle.
    pub fn add_error(&self, error: CollectionError) {
        if error.is_cancelled() {
            if self.logs(Level::Debug) {
                sluice_log::debug!(source = self.source(), "collection cancelled");
            }
            return;
        }

        if self.logs(Level::Error) {
            sluice_log::error!(
                error = &error as &dyn Error,
                source = self.source(),
                "collection failed"
            );
        }
        metric!(
            counter(PipelineCounters::CollectionFailed) += 1,
            source = self.source()
        );
    }

    /// Wraps this accumulator to track delivery of every point.
    ///
    /// At most `max_undelivered` points may be outstanding at a time.
    pub fn tracking(&self, max_undelivered: usize) -> TrackingAccumulator {
        TrackingAccumulator::new(self.clone(), max_undelivered)
    }

    /// Applies filter and decorations. Returns `None` if the point must not enter the pipeline.
    fn prepare(&self, mut point: DataPoint) -> Option<DataPoint> {
        if point.fields.is_empty() {
            if self.logs(Level::Debug) {
                sluice_log::debug!(
                    source = self.source(),
                    name = %point.name,
                    "point without fields, discarding"
                );
            }
            return None;
        }

        match self.filter.select(&point) {
            Ok(true) => (),
            Ok(false) => return None,
            Err(error) => {
                if self.logs(Level::Error) {
                    sluice_log::error!(
                        error = &error as &dyn Error,
                        source = self.source(),
                        "filtering failed"
                    );
                }
                return None;
            }
        }

        if self.filter.modify(&mut point).is_err() || point.fields.is_empty() {
            return None;
        }

        self.decorations.apply(&mut point);
        Some(point)
    }

    /// Sends a prepared point to the router. Returns the point if the router is gone.
    fn forward(&self, point: DataPoint) -> Option<DataPoint> {
        metric!(
            counter(PipelineCounters::PointsGathered) += 1,
            source = self.source()
        );

        match self.tx.send(point) {
            Ok(()) => None,
            Err(mpsc::error::SendError(point)) => {
                if self.logs(Level::Debug) {
                    sluice_log::debug!(
                        source = self.source(),
                        "router stopped, discarding point"
                    );
                }
                Some(point)
            }
        }
    }

    fn logs(&self, level: Level) -> bool {
        self.log_level.is_none_or(|max| max.allows(level))
    }
}

/// An accumulator that tracks the delivery of every point it adds.
///
/// This is meant for sources that acknowledge upstream, such as message queue consumers. Adding a
/// point waits while `max_undelivered` points are outstanding. Capacity is released as outcomes
/// are received with [`next_delivery`](Self::next_delivery).
#[derive(Debug)]
pub struct TrackingAccumulator {
    inner: Accumulator,
    notifier: DeliveryNotifier,
    deliveries: AsyncMutex<mpsc::UnboundedReceiver<DeliveryInfo>>,
    capacity: Semaphore,
    max_undelivered: usize,
}

impl TrackingAccumulator {
    fn new(inner: Accumulator, max_undelivered: usize) -> Self {
        let (notifier, deliveries) = crate::tracking::delivery_channel();
        let max_undelivered = max_undelivered.max(1);
        Self {
            inner,
            notifier,
            deliveries: AsyncMutex::new(deliveries),
            capacity: Semaphore::new(max_undelivered),
            max_undelivered,
        }
    }

    /// Returns the untracked accumulator, for example to report errors.
    pub fn accumulator(&self) -> &Accumulator {
        &self.inner
    }

    /// Adds a point and tracks its delivery.
    ///
    /// Waits for capacity first. Points the source filter discards resolve immediately as
    /// delivered, points that cannot be routed resolve as failed.
    pub async fn add_tracked(&self, point: DataPoint) -> TrackingId {
        if let Ok(permit) = self.capacity.acquire().await {
            permit.forget();
        }

        let (id, point) = self.inner.registry.track(point, &self.notifier);
        self.inner.add_point(point);
        id
    }

    /// Waits for the next resolved point and releases its capacity.
    ///
    /// Returns `None` if no tracked point is outstanding.
    pub async fn next_delivery(&self) -> Option<DeliveryInfo> {
        let mut deliveries = self.deliveries.lock().await;
        if self.outstanding() == 0 {
            return None;
        }

        let info = deliveries.recv().await?;
        self.capacity.add_permits(1);
        Some(info)
    }

    /// Returns the number of added points whose outcome has not been received yet.
    pub fn outstanding(&self) -> usize {
        self.max_undelivered
            .saturating_sub(self.capacity.available_permits())
    }

    /// Returns the number of points that may still be added without waiting.
    pub fn available(&self) -> usize {
        self.capacity.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::filter::FilterConfig;
    use crate::point::FieldValue;

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(0, 0).unwrap()
    }

    fn fields(value: i64) -> Fields {
        Fields::from([("value".to_owned(), FieldValue::Int(value))])
    }

    fn accumulator(
        config: SourceConfig,
    ) -> (
        Accumulator,
        Arc<TrackingRegistry>,
        mpsc::UnboundedReceiver<DataPoint>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(TrackingRegistry::new());
        let clock = Arc::new(ManualClock::from_secs(42));
        let acc = Accumulator::new(&config, clock, Arc::clone(&registry), tx);
        (acc, registry, rx)
    }

    #[test]
    fn test_default_timestamp_and_decorations() {
        let (acc, _, mut rx) = accumulator(SourceConfig {
            plugin: "cpu".to_owned(),
            decorations: Decorations {
                measurement_prefix: Some("host_".to_owned()),
                tags: Tags::from([
                    ("dc".to_owned(), "eu".to_owned()),
                    ("host".to_owned(), "ignored".to_owned()),
                ]),
                ..Default::default()
            },
            ..Default::default()
        });

        acc.add_fields(
            "cpu",
            fields(1),
            Tags::from([("host".to_owned(), "a".to_owned())]),
            None,
        );

        let point = rx.try_recv().unwrap();
        assert_eq!(point.name, "host_cpu");
        assert_eq!(point.timestamp, DateTime::from_timestamp(42, 0).unwrap());
        assert_eq!(point.tags["host"], "a");
        assert_eq!(point.tags["dc"], "eu");
    }

    #[test]
    fn test_points_without_fields_dropped() {
        let (acc, _, mut rx) = accumulator(SourceConfig::default());

        acc.add_fields("cpu", Fields::new(), Tags::new(), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_filter_applies() {
        let (acc, _, mut rx) = accumulator(SourceConfig {
            filter: FilterConfig {
                namedrop: vec!["mem".to_owned()],
                fielddrop: vec!["secret".to_owned()],
                ..Default::default()
            },
            ..Default::default()
        });

        acc.add_fields("mem", fields(1), Tags::new(), None);

        let mut values = fields(2);
        values.insert("secret".to_owned(), FieldValue::Int(3));
        acc.add_fields("cpu", values, Tags::new(), None);

        let point = rx.try_recv().unwrap();
        assert_eq!(point.name, "cpu");
        assert!(!point.fields.contains_key("secret"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_errors_counted() {
        let (acc, _, _rx) = accumulator(SourceConfig {
            plugin: "kubernetes".to_owned(),
            ..Default::default()
        });

        let captures = sluice_statsd::with_capturing_test_client(|| {
            acc.add_error(CollectionError::new("boom"));
            acc.add_error(CollectionError::Cancelled);
        });

        insta::assert_debug_snapshot!(captures, @r#"
        [
            "pipeline.source.failed:1|c|#source:sources.kubernetes",
        ]
        "#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_backpressure() {
        let (acc, registry, mut rx) = accumulator(SourceConfig::default());
        let tracked = acc.tracking(1);

        let first = tracked
            .add_tracked(DataPoint::new("cpu", Tags::new(), fields(1), epoch()))
            .await;
        assert_eq!(tracked.available(), 0);

        let blocked = tokio::time::timeout(
            Duration::from_secs(1),
            tracked.add_tracked(DataPoint::new(
                "cpu",
                Tags::new(),
                fields(2),
                epoch(),
            )),
        )
        .await;
        assert!(blocked.is_err());

        let routed = rx.try_recv().unwrap();
        assert_eq!(routed.tracking_id(), Some(first));

        registry.register_obligations(first, 1).unwrap();
        registry.report_outcome(first, true).unwrap();

        let info = tracked.next_delivery().await.unwrap();
        assert_eq!(info, DeliveryInfo { id: first, delivered: true });
        assert_eq!(tracked.available(), 1);
    }

    #[tokio::test]
    async fn test_filtered_tracked_point_resolves() {
        let (acc, registry, mut rx) = accumulator(SourceConfig {
            filter: FilterConfig {
                namepass: vec!["mem".to_owned()],
                ..Default::default()
            },
            ..Default::default()
        });
        let tracked = acc.tracking(10);

        let id = tracked
            .add_tracked(DataPoint::new("cpu", Tags::new(), fields(1), epoch()))
            .await;

        assert!(rx.try_recv().is_err());
        assert_eq!(registry.pending(), 0);
        let info = tracked.next_delivery().await.unwrap();
        assert_eq!(info, DeliveryInfo { id, delivered: true });
    }

    #[tokio::test]
    async fn test_unroutable_tracked_point_fails() {
        let (acc, _, rx) = accumulator(SourceConfig::default());
        drop(rx);
        let tracked = acc.tracking(10);

        let id = tracked
            .add_tracked(DataPoint::new("cpu", Tags::new(), fields(1), epoch()))
            .await;

        let info = tracked.next_delivery().await.unwrap();
        assert_eq!(info, DeliveryInfo { id, delivered: false });
    }

    #[tokio::test]
    async fn test_next_delivery_ends_when_nothing_outstanding() {
        let (acc, registry, mut rx) = accumulator(SourceConfig::default());
        let tracked = acc.tracking(4);
        assert!(tracked.next_delivery().await.is_none());

        let id = tracked
            .add_tracked(DataPoint::new("cpu", Tags::new(), fields(1), epoch()))
            .await;
        assert_eq!(tracked.outstanding(), 1);
        rx.try_recv().unwrap();

        registry.register_obligations(id, 1).unwrap();
        registry.report_outcome(id, true).unwrap();

        let mut received = Vec::new();
        while let Some(info) = tracked.next_delivery().await {
            received.push(info);
        }
        assert_eq!(received, [DeliveryInfo { id, delivered: true }]);
        assert_eq!(tracked.outstanding(), 0);
        assert_eq!(tracked.available(), 4);
    }

    #[test]
    fn test_tracked_point_through_plain_accumulator_resolves() {
        let (acc, registry, mut rx) = accumulator(SourceConfig {
            filter: FilterConfig {
                namedrop: vec!["cpu".to_owned()],
                ..Default::default()
            },
            ..Default::default()
        });
        let (notifier, mut deliveries) = crate::tracking::delivery_channel();

        let (dropped, point) = registry.track(
            DataPoint::new("cpu", Tags::new(), fields(1), epoch()),
            &notifier,
        );
        acc.add_point(point);
        assert!(rx.try_recv().is_err());

        let (empty, point) = registry.track(
            DataPoint::new("mem", Tags::new(), Fields::new(), epoch()),
            &notifier,
        );
        acc.add_point(point);

        assert_eq!(registry.pending(), 0);
        assert_eq!(
            deliveries.try_recv().unwrap(),
            DeliveryInfo { id: dropped, delivered: true }
        );
        assert_eq!(
            deliveries.try_recv().unwrap(),
            DeliveryInfo { id: empty, delivered: true }
        );

        drop(rx);
        let (unroutable, point) = registry.track(
            DataPoint::new("mem", Tags::new(), fields(2), epoch()),
            &notifier,
        );
        acc.add_point(point);

        assert_eq!(registry.pending(), 0);
        assert_eq!(
            deliveries.try_recv().unwrap(),
            DeliveryInfo { id: unroutable, delivered: false }
        );
    }
}
