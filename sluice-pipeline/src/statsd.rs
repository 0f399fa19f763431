use sluice_statsd::{CounterMetric, DistributionMetric, GaugeMetric, TimerMetric};

/// Counter metrics for the pipeline.
pub enum PipelineCounters {
    /// Incremented for every point a source hands to its accumulator.
    ///
    /// Tagged by `source`.
    PointsGathered,

    /// Incremented every time a source fails a collection cycle.
    ///
    /// Tagged by `source`.
    CollectionFailed,

    /// Incremented for every point an aggregator folds into its window.
    ///
    /// Tagged by `aggregator`.
    AggregatorAdded,

    /// Incremented for every point an aggregator does not select.
    ///
    /// Tagged by `aggregator`.
    AggregatorFiltered,

    /// Incremented for every selected point outside of the open window, or offered while the
    /// aggregator is not running.
    ///
    /// Tagged by `aggregator`.
    AggregatorDropped,

    /// Incremented for every aggregate point emitted at the end of a period.
    ///
    /// Tagged by `aggregator`.
    AggregatorPushed,

    /// Incremented when the window re-anchors after the clock moved past more than one period.
    ///
    /// Tagged by `aggregator`.
    WindowReanchored,

    /// Incremented for every point successfully written by a sink.
    ///
    /// Tagged by `sink`.
    SinkWritten,

    /// Incremented for every point evicted from a full sink buffer.
    ///
    /// Tagged by `sink`.
    SinkDropped,

    /// Incremented every time a sink fails to write a batch.
    ///
    /// Tagged by `sink`.
    SinkFailed,

    /// Incremented for every violation of the delivery tracking protocol.
    ///
    /// Tagged by `kind`.
    TrackingProtocolError,

    /// Incremented every time a tracked point resolves.
    ///
    /// Tagged by `delivered`.
    DeliveryResolved,
}

impl CounterMetric for PipelineCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::PointsGathered => "pipeline.source.gathered",
            Self::CollectionFailed => "pipeline.source.failed",
            Self::AggregatorAdded => "pipeline.aggregator.added",
            Self::AggregatorFiltered => "pipeline.aggregator.filtered",
            Self::AggregatorDropped => "pipeline.aggregator.dropped",
            Self::AggregatorPushed => "pipeline.aggregator.pushed",
            Self::WindowReanchored => "pipeline.aggregator.reanchored",
            Self::SinkWritten => "pipeline.sink.written",
            Self::SinkDropped => "pipeline.sink.dropped",
            Self::SinkFailed => "pipeline.sink.failed",
            Self::TrackingProtocolError => "pipeline.tracking.protocol_error",
            Self::DeliveryResolved => "pipeline.tracking.resolved",
        }
    }
}

/// Timer metrics for the pipeline.
pub enum PipelineTimers {
    /// Time spent in a single collection cycle of a source.
    ///
    /// Tagged by `source`.
    GatherDuration,

    /// Time an aggregator spends producing and resetting its aggregates at the end of a period.
    ///
    /// Tagged by `aggregator`.
    PushDuration,

    /// Time a sink adapter needs to write one batch.
    ///
    /// Tagged by `sink`.
    WriteDuration,
}

impl TimerMetric for PipelineTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::GatherDuration => "pipeline.source.gather_duration",
            Self::PushDuration => "pipeline.aggregator.push_duration",
            Self::WriteDuration => "pipeline.sink.write_duration",
        }
    }
}

/// Gauge metrics for the pipeline.
pub enum PipelineGauges {
    /// The number of tracked points waiting for their delivery outcome.
    TrackingPending,

    /// The number of points buffered in a sink.
    ///
    /// Tagged by `sink`.
    SinkBuffered,
}

impl GaugeMetric for PipelineGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::TrackingPending => "pipeline.tracking.pending",
            Self::SinkBuffered => "pipeline.sink.buffered",
        }
    }
}

/// Distribution metrics for the pipeline.
pub enum PipelineDistributions {
    /// The number of points in a batch handed to a sink adapter.
    ///
    /// Tagged by `sink`.
    BatchSize,
}

impl DistributionMetric for PipelineDistributions {
    fn name(&self) -> &'static str {
        match *self {
            Self::BatchSize => "pipeline.sink.batch_size",
        }
    }
}
