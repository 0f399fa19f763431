//! Internal metrics of the pipeline, reported to statsd through `cadence`.
//!
//! The pipeline reports its own health through this crate: points gathered and written, windows
//! pushed, delivery resolutions and the time spent in each stage. These metrics are unrelated to
//! the data points the pipeline carries.
//!
//! # Declaring Metrics
//!
//! Metric names are declared on enums implementing one of [`CounterMetric`], [`GaugeMetric`],
//! [`DistributionMetric`] or [`TimerMetric`]. The trait decides how a value is reported, so a
//! counter cannot accidentally be sent as a timer.
//!
//! ```
//! use sluice_statsd::{CounterMetric, metric};
//!
//! enum SinkCounters {
//!     Written,
//! }
//!
//! impl CounterMetric for SinkCounters {
//!     fn name(&self) -> &'static str {
//!         match self {
//!             Self::Written => "sink.written",
//!         }
//!     }
//! }
//!
//! metric!(counter(SinkCounters::Written) += 10, sink = "sinks.discard");
//! ```
//!
//! # Reporting
//!
//! Until [`init`] or [`set_client`] is called, [`metric!`] does nothing. [`init`] resolves the
//! statsd host and installs a client that queues metrics and sends them from a background thread.
//!
//! ```no_run
//! use std::collections::BTreeMap;
//!
//! sluice_statsd::init(sluice_statsd::MetricsConfig {
//!     prefix: "sluice".to_owned(),
//!     host: "127.0.0.1:8125".to_owned(),
//!     buffer_size: None,
//!     default_tags: BTreeMap::new(),
//!     sample_rate: 1.0,
//! })?;
//! # Ok::<(), sluice_statsd::MetricsError>(())
//! ```
//!
//! Tests use [`with_capturing_test_client`] to inspect what a piece of code reports.
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::sync::Arc;

use cadence::{BufferedUdpMetricSink, Metric, MetricBuilder, QueuingMetricSink, StatsdClient};
use parking_lot::RwLock;
use rand::Rng;

/// Metrics queued beyond this number are dropped.
const MAX_QUEUED_METRICS: usize = 100_000;

/// Probability between `0.0` and `1.0` that a metric is sent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleRate(f64);

impl SampleRate {
    fn sampled(self) -> bool {
        match self.0 {
            rate if rate >= 1.0 => true,
            rate if rate <= 0.0 => false,
            rate => rand::rng().random_bool(rate),
        }
    }
}

impl From<f64> for SampleRate {
    fn from(value: f64) -> Self {
        if value.is_nan() {
            return Self(0.0);
        }
        Self(value.clamp(0.0, 1.0))
    }
}

/// The statsd client used by [`metric!`].
#[derive(Debug)]
pub struct MetricsClient {
    /// The underlying `cadence` client.
    pub statsd_client: StatsdClient,
    /// Tags added to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Share of metrics that are sent.
    pub sample_rate: SampleRate,
}

impl MetricsClient {
    /// Sends a metric with the default tags, subject to the sample rate.
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        if !self.sample_rate.sampled() {
            return;
        }

        for (key, value) in &self.default_tags {
            metric = metric.with_tag(key, value);
        }
        if self.sample_rate.0 < 1.0 {
            metric = metric.with_sampling_rate(self.sample_rate.0);
        }

        if let Err(error) = metric.try_send() {
            sluice_log::error!(
                error = &error as &dyn std::error::Error,
                queue_size = MAX_QUEUED_METRICS,
                "failed to send metric",
            );
        }
    }
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &StatsdClient {
        &self.statsd_client
    }
}

/// Settings for [`init`].
#[derive(Debug)]
pub struct MetricsConfig {
    /// Prepended to every metric name.
    pub prefix: String,
    /// Host and port of the statsd server.
    pub host: String,
    /// Size of the UDP buffer in bytes, or the `cadence` default if `None`.
    pub buffer_size: Option<usize>,
    /// Tags added to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Share of metrics that are sent, between `0.0` and `1.0`.
    pub sample_rate: f64,
}

/// An error returned by [`init`].
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The statsd host could not be resolved.
    #[error("failed to resolve statsd host")]
    Io(#[from] io::Error),
    /// The statsd host did not resolve to any address.
    #[error("no address found for statsd host {0}")]
    NoAddress(String),
    /// The UDP sink could not be created.
    #[error("failed to create statsd sink")]
    Sink(#[from] cadence::MetricError),
}

static GLOBAL_CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

thread_local! {
    // Cached per thread so that recording a metric does not contend on the global lock.
    static LOCAL_CLIENT: RefCell<Option<Arc<MetricsClient>>> =
        RefCell::new(GLOBAL_CLIENT.read().clone());
}

#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

/// Installs the client for all threads.
///
/// Threads that already recorded a metric keep their previous client, except the calling thread.
pub fn set_client(client: MetricsClient) {
    let client = Arc::new(client);
    *GLOBAL_CLIENT.write() = Some(Arc::clone(&client));
    LOCAL_CLIENT.with(|cell| cell.replace(Some(client)));
}

/// Runs `f` with a client that captures metrics instead of sending them.
///
/// Only metrics recorded on the current thread are captured. Returns the captured metrics in
/// statsd line format, for example `"pipeline.sink.written:3|c|#sink:sinks.discard"`.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let (rx, sink) = cadence::SpyMetricSink::new();
    let client = MetricsClient {
        statsd_client: StatsdClient::from_sink("", sink),
        default_tags: BTreeMap::new(),
        sample_rate: SampleRate(1.0),
    };

    LOCAL_CLIENT.with(|cell| {
        let previous = cell.replace(Some(Arc::new(client)));
        f();
        cell.replace(previous);
    });

    rx.try_iter()
        .map(|line| String::from_utf8_lossy(&line).into_owned())
        .collect()
}

fn bind_socket(upstream: SocketAddr) -> io::Result<UdpSocket> {
    let local = match upstream {
        SocketAddr::V4(_) => "0.0.0.0:0",
        SocketAddr::V6(_) => "[::]:0",
    };
    let socket = UdpSocket::bind(local)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Starts reporting metrics to statsd.
///
/// Metrics are buffered into UDP datagrams and sent from a background thread, so recording a
/// metric never blocks the caller.
pub fn init(config: MetricsConfig) -> Result<(), MetricsError> {
    let addr = config
        .host
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| MetricsError::NoAddress(config.host.clone()))?;

    let sample_rate = SampleRate::from(config.sample_rate);
    sluice_log::info!(
        sample_rate = sample_rate.0,
        "reporting metrics to statsd at {addr}"
    );

    let socket = bind_socket(addr)?;
    let udp_sink = match config.buffer_size {
        Some(size) => BufferedUdpMetricSink::with_capacity(addr, socket, size)?,
        None => BufferedUdpMetricSink::from(addr, socket)?,
    };
    let queuing_sink = QueuingMetricSink::with_capacity(udp_sink, MAX_QUEUED_METRICS);

    set_client(MetricsClient {
        statsd_client: StatsdClient::from_sink(&config.prefix, queuing_sink),
        default_tags: config.default_tags,
        sample_rate,
    });

    Ok(())
}

/// Calls `f` with the client of the current thread.
///
/// Returns the default value without calling `f` if no client is installed. Prefer [`metric!`].
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    LOCAL_CLIENT.with(|cell| match cell.borrow().as_deref() {
        Some(client) => f(client),
        None => R::default(),
    })
}

/// A counter, incremented by the reporting code.
///
/// ```
/// use sluice_statsd::{CounterMetric, metric};
///
/// struct Dropped;
///
/// impl CounterMetric for Dropped {
///     fn name(&self) -> &'static str {
///         "dropped"
///     }
/// }
///
/// let evicted = 3;
/// metric!(counter(Dropped) += evicted, sink = "sinks.discard");
/// ```
pub trait CounterMetric {
    /// Returns the name of the counter.
    fn name(&self) -> &'static str;
}

/// A gauge, set to the current value of some quantity.
pub trait GaugeMetric {
    /// Returns the name of the gauge.
    fn name(&self) -> &'static str;
}

/// A distribution of values, such as batch sizes.
pub trait DistributionMetric {
    /// Returns the name of the distribution.
    fn name(&self) -> &'static str;
}

/// A duration, reported in milliseconds.
///
/// ```
/// use std::time::Instant;
/// use sluice_statsd::{TimerMetric, metric};
///
/// struct PushDuration;
///
/// impl TimerMetric for PushDuration {
///     fn name(&self) -> &'static str {
///         "push_duration"
///     }
/// }
///
/// let started = Instant::now();
/// metric!(timer(PushDuration) = started.elapsed(), aggregator = "aggregators.sum");
/// ```
pub trait TimerMetric {
    /// Returns the name of the timer.
    fn name(&self) -> &'static str;
}

/// Records a metric with the client of the current thread.
///
/// Supported forms, each optionally followed by `key = value` tags:
///
///  - `counter(id) += value`, skipped if the value is zero,
///  - `gauge(id) = value`,
///  - `distribution(id) = value`,
///  - `timer(id) = duration`.
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        match $value {
            0 => {}
            value => $crate::with_client(|client| {
                use $crate::_pred::*;
                client.send_metric(
                    client.count_with_tags($crate::CounterMetric::name(&$id), value)
                        $(.with_tag(stringify!($($k).*), $v))*
                )
            }),
        }
    };

    (gauge($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.gauge_with_tags($crate::GaugeMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    (distribution($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.distribution_with_tags($crate::DistributionMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    (timer($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            // Durations are sent as fractional milliseconds.
            let millis = ::std::time::Duration::as_nanos(&$value) as f64 / 1e6;
            client.send_metric(
                client.distribution_with_tags($crate::TimerMetric::name(&$id), millis)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };
}
