use sluice_statsd::CounterMetric;

/// Counter metrics for the agent setup.
pub enum SluiceCounters {
    /// Incremented for every configured instance that failed to initialize.
    ///
    /// Tagged by `kind`, one of `sources`, `processors`, `aggregators` or `sinks`.
    InstanceFailed,
}

impl CounterMetric for SluiceCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::InstanceFailed => "sluice.instance.failed",
        }
    }
}
