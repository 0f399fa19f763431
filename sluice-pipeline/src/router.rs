use std::sync::Arc;

use crate::aggregator::RunningAggregator;
use crate::point::DataPoint;
use crate::processor::RunningProcessor;
use crate::sink::RunningSink;
use crate::tracking::{TrackingId, TrackingRegistry};

/// Moves points from the sources through processors and aggregators into the sinks.
///
/// The router registers delivery obligations for tracked points. A tracked point that a processor
/// drops, that an aggregator consumes, or that no sink selects resolves immediately as delivered.
#[derive(Debug)]
pub struct Router {
    processors: Vec<RunningProcessor>,
    aggregators: Vec<Arc<RunningAggregator>>,
    sinks: Vec<Arc<RunningSink>>,
    registry: Arc<TrackingRegistry>,
}

impl Router {
    /// Creates a router. Processors run by ascending order, ties keep their given order.
    pub fn new(
        mut processors: Vec<RunningProcessor>,
        aggregators: Vec<Arc<RunningAggregator>>,
        sinks: Vec<Arc<RunningSink>>,
        registry: Arc<TrackingRegistry>,
    ) -> Self {
        processors.sort_by_key(RunningProcessor::order);
        Self {
            processors,
            aggregators,
            sinks,
            registry,
        }
    }

    /// Routes a point collected by a source.
    pub fn route(&mut self, point: DataPoint) {
        let id = point.tracking_id();

        let mut point = point;
        for processor in &mut self.processors {
            match processor.apply(point) {
                Some(processed) => point = processed,
                None => {
                    self.resolve(id);
                    return;
                }
            }
        }

        // A processor may replace the point and lose its tracking on the way.
        if id.is_some() && point.tracking_id() != id {
            self.resolve(id);
        }

        let mut drop_original = false;
        for aggregator in &self.aggregators {
            drop_original |= aggregator.add(&point);
        }

        if drop_original {
            self.resolve(point.tracking_id());
            return;
        }

        self.dispatch(point);
    }

    /// Routes the output of an aggregator directly to the sinks.
    pub fn route_aggregated(&self, points: Vec<DataPoint>) {
        for point in points {
            self.dispatch(point);
        }
    }

    /// Hands a point to every sink that selects it.
    fn dispatch(&self, point: DataPoint) {
        let selected: Vec<&RunningSink> = self
            .sinks
            .iter()
            .map(Arc::as_ref)
            .filter(|sink| sink.select(&point))
            .collect();

        if let Some(id) = point.tracking_id() {
            // Violations are logged and counted by the registry.
            let _ = self.registry.register_obligations(id, selected.len());
        }

        if let Some((last, rest)) = selected.split_last() {
            for sink in rest {
                sink.add(point.clone());
            }
            last.add(point);
        }
    }

    fn resolve(&self, id: Option<TrackingId>) {
        if let Some(id) = id {
            let _ = self.registry.register_obligations(id, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::aggregation::Sum;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{AgentConfig, AggregatorConfig, ProcessorConfig, SinkConfig};
    use crate::filter::FilterConfig;
    use crate::point::{FieldValue, Fields, Tags};
    use crate::processor::{Processor, Round, RoundConfig};
    use crate::sink::DiscardSink;
    use crate::tracking::{DeliveryInfo, delivery_channel};

    fn point(name: &str, value: f64) -> DataPoint {
        DataPoint::new(
            name,
            Tags::new(),
            Fields::from([("value".to_owned(), FieldValue::Float(value))]),
            DateTime::from_timestamp(1, 0).unwrap(),
        )
    }

    fn sink(
        registry: &Arc<TrackingRegistry>,
        alias: &str,
        namepass: &[&str],
    ) -> Arc<RunningSink> {
        let config = SinkConfig {
            plugin: "discard".to_owned(),
            alias: Some(alias.to_owned()),
            filter: FilterConfig {
                namepass: namepass.iter().map(|n| (*n).to_owned()).collect(),
                ..Default::default()
            },
            ..Default::default()
        };

        let mut sink = RunningSink::new(Box::new(DiscardSink), config, Arc::clone(registry));
        sink.init(&AgentConfig::default()).unwrap();
        Arc::new(sink)
    }

    fn aggregator(drop_original: bool) -> Arc<RunningAggregator> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::from_secs(0));
        let config = AggregatorConfig {
            plugin: "sum".to_owned(),
            period: 10,
            drop_original,
            ..Default::default()
        };

        let mut aggregator = RunningAggregator::new(Box::new(Sum::default()), config, clock);
        aggregator.init().unwrap();
        aggregator.start();
        Arc::new(aggregator)
    }

    struct DropAll;

    impl Processor for DropAll {
        fn apply(&mut self, _point: DataPoint) -> Option<DataPoint> {
            None
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_selected_sinks() {
        let registry = Arc::new(TrackingRegistry::new());
        let (notifier, mut rx) = delivery_channel();
        let sinks = vec![
            sink(&registry, "a", &[]),
            sink(&registry, "b", &["cpu"]),
            sink(&registry, "c", &["mem"]),
        ];
        let mut router = Router::new(vec![], vec![], sinks.clone(), Arc::clone(&registry));

        let (id, tracked) = registry.track(point("cpu", 1.0), &notifier);
        router.route(tracked);

        assert_eq!(sinks[0].buffered(), 1);
        assert_eq!(sinks[1].buffered(), 1);
        assert_eq!(sinks[2].buffered(), 0);

        sinks[0].flush().await.unwrap();
        assert!(rx.try_recv().is_err());
        sinks[1].flush().await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), DeliveryInfo { id, delivered: true });
    }

    #[test]
    fn test_no_sink_resolves_immediately() {
        let registry = Arc::new(TrackingRegistry::new());
        let (notifier, mut rx) = delivery_channel();
        let sinks = vec![sink(&registry, "a", &["mem"])];
        let mut router = Router::new(vec![], vec![], sinks, Arc::clone(&registry));

        let (id, tracked) = registry.track(point("cpu", 1.0), &notifier);
        router.route(tracked);

        assert_eq!(rx.try_recv().unwrap(), DeliveryInfo { id, delivered: true });
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_drop_original() {
        let registry = Arc::new(TrackingRegistry::new());
        let (notifier, mut rx) = delivery_channel();
        let sinks = vec![sink(&registry, "a", &[])];
        let aggregators = vec![aggregator(false), aggregator(true)];
        let mut router = Router::new(
            vec![],
            aggregators.clone(),
            sinks.clone(),
            Arc::clone(&registry),
        );

        let (id, tracked) = registry.track(point("cpu", 1.0), &notifier);
        router.route(tracked);

        assert_eq!(sinks[0].buffered(), 0);
        assert_eq!(rx.try_recv().unwrap(), DeliveryInfo { id, delivered: true });

        // Both aggregators saw the point.
        for aggregator in &aggregators {
            let mut out = Vec::new();
            aggregator.push(&mut out).unwrap();
            assert_eq!(out.len(), 1);
        }
    }

    #[test]
    fn test_processor_drop_resolves() {
        let registry = Arc::new(TrackingRegistry::new());
        let (notifier, mut rx) = delivery_channel();
        let sinks = vec![sink(&registry, "a", &[])];

        let mut processor = RunningProcessor::new(
            Box::new(DropAll),
            ProcessorConfig {
                plugin: "drop".to_owned(),
                ..Default::default()
            },
        );
        processor.init().unwrap();

        let mut router = Router::new(
            vec![processor],
            vec![],
            sinks.clone(),
            Arc::clone(&registry),
        );

        let (id, tracked) = registry.track(point("cpu", 1.0), &notifier);
        router.route(tracked);

        assert_eq!(sinks[0].buffered(), 0);
        assert_eq!(rx.try_recv().unwrap(), DeliveryInfo { id, delivered: true });
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<parking_lot::Mutex<Vec<DataPoint>>>);

    #[async_trait::async_trait]
    impl crate::sink::Sink for Capture {
        async fn write(&mut self, points: &[DataPoint]) -> Result<(), crate::SinkError> {
            self.0.lock().extend_from_slice(points);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_processors_run_in_order() {
        let registry = Arc::new(TrackingRegistry::new());
        let capture = Capture::default();
        let mut sink = RunningSink::new(
            Box::new(capture.clone()),
            SinkConfig {
                plugin: "capture".to_owned(),
                ..Default::default()
            },
            Arc::clone(&registry),
        );
        sink.init(&AgentConfig::default()).unwrap();
        let sink = Arc::new(sink);

        let round = |precision, order| {
            let mut processor = RunningProcessor::new(
                Box::new(Round::new(RoundConfig {
                    precision,
                    ..Default::default()
                })),
                ProcessorConfig {
                    plugin: "round".to_owned(),
                    order,
                    ..Default::default()
                },
            );
            processor.init().unwrap();
            processor
        };

        // One decimal first gives 5.0 and then 10, tens first would give 0.
        let processors = vec![round(-1, 2), round(1, 1)];
        let mut router = Router::new(processors, vec![], vec![Arc::clone(&sink)], registry);

        router.route(point("cpu", 4.96));
        sink.flush().await.unwrap();

        let points = capture.0.lock();
        assert_eq!(points[0].fields["value"], FieldValue::Float(10.0));
    }

    #[test]
    fn test_aggregated_points_untracked() {
        let registry = Arc::new(TrackingRegistry::new());
        let sinks = vec![sink(&registry, "a", &[]), sink(&registry, "b", &[])];
        let router = Router::new(vec![], vec![], sinks.clone(), Arc::clone(&registry));

        router.route_aggregated(vec![point("cpu", 1.0), point("cpu", 2.0)]);

        assert_eq!(sinks[0].buffered(), 2);
        assert_eq!(sinks[1].buffered(), 2);
        assert_eq!(registry.pending(), 0);
    }
}
