//! Errors reported by pipeline stages.

use std::error::Error;
use std::time::Duration;

use thiserror::Error;

use crate::tracking::TrackingId;

/// A type-erased error raised by an external adapter.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Invalid settings of a single plugin instance.
///
/// Configuration errors are raised at startup and only prevent the affected instance from
/// running. Sibling instances start regardless.
#[derive(Debug, Error)]
#[error(
    "invalid configuration{}: {kind}",
    .instance.as_deref().map(|i| format!(" for {i}")).unwrap_or_default()
)]
pub struct ConfigurationError {
    instance: Option<String>,
    kind: ConfigurationErrorKind,
}

impl ConfigurationError {
    /// Creates an error for an invalid plugin-specific setting.
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigurationErrorKind::Invalid(message.into()).into()
    }

    /// Creates an error for plugin options that could not be deserialized.
    pub fn options(error: serde_json::Error) -> Self {
        ConfigurationErrorKind::Options(error.to_string()).into()
    }

    /// Attaches the name of the failing instance.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Returns the name of the failing instance, if known.
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }
}

impl From<ConfigurationErrorKind> for ConfigurationError {
    fn from(kind: ConfigurationErrorKind) -> Self {
        Self {
            instance: None,
            kind,
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum ConfigurationErrorKind {
    /// The aggregation period is zero.
    #[error("period must be positive")]
    NonPositivePeriod,
    /// A duration does not fit into the supported time range.
    #[error("`{0}` is out of range")]
    DurationOutOfRange(&'static str),
    /// A filter pattern failed to compile.
    #[error("{0}")]
    Filter(#[from] FilterError),
    /// A literal pattern appears on both sides of an include/exclude pair.
    #[error("pattern {pattern:?} is listed in both `{include}` and `{exclude}`")]
    Contradictory {
        pattern: String,
        include: &'static str,
        exclude: &'static str,
    },
    /// No factory is registered under the plugin name.
    #[error("unknown plugin {0:?}")]
    UnknownPlugin(String),
    /// A factory with the same name is already registered.
    #[error("plugin {0:?} is registered twice")]
    DuplicatePlugin(String),
    /// Plugin options failed to deserialize.
    #[error("invalid options: {0}")]
    Options(String),
    /// A plugin rejected its own settings.
    #[error("{0}")]
    Invalid(String),
}

/// A malformed filter pattern.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid filter pattern {pattern:?}: {message}")]
pub struct FilterError {
    /// The pattern as written in the configuration.
    pub pattern: String,
    /// The reason the pattern was rejected.
    pub message: String,
}

/// A source failed during one collection cycle.
///
/// The cycle continues for other targets and the source is retried on its next tick.
#[derive(Debug, Error)]
pub enum CollectionError {
    /// Collection from one fan-out target failed.
    #[error("failed to collect from {target}")]
    Target {
        /// Label of the target, such as a node URL.
        target: String,
        /// The underlying failure.
        #[source]
        source: BoxError,
    },
    /// The collection cycle was cancelled by shutdown.
    #[error("collection cancelled")]
    Cancelled,
    /// The collection did not finish within its time budget.
    #[error("collection timed out after {0:?}")]
    Timeout(Duration),
    /// Any other failure of the source adapter.
    #[error("collection failed")]
    Other(#[source] BoxError),
}

impl CollectionError {
    /// Wraps an adapter error.
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self::Other(error.into())
    }

    /// Wraps an adapter error that occurred for a specific target.
    pub fn target(target: impl Into<String>, error: impl Into<BoxError>) -> Self {
        Self::Target {
            target: target.into(),
            source: error.into(),
        }
    }

    /// Returns `true` if this error signals cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// An error returned by a sink adapter.
#[derive(Debug, Error)]
#[error("sink write failed")]
pub struct SinkError(#[source] BoxError);

impl SinkError {
    /// Wraps an adapter error.
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self(error.into())
    }
}

/// A failure while pushing aggregates or flushing a sink.
///
/// Aggregator state is reset regardless, so the next period starts cleanly.
#[derive(Debug, Error)]
pub enum PushError {
    /// The aggregation algorithm failed to produce its output.
    #[error("aggregation failed")]
    Aggregation(#[source] BoxError),
    /// The sink rejected a batch.
    #[error("failed to write batch to {sink}")]
    Sink {
        /// Name of the sink instance.
        sink: String,
        /// The adapter error.
        #[source]
        source: SinkError,
    },
    /// The aggregator has not been started or was already stopped.
    #[error("aggregator is not running")]
    NotRunning,
}

impl PushError {
    /// Wraps an error raised by an aggregation algorithm.
    pub fn aggregation(error: impl Into<BoxError>) -> Self {
        Self::Aggregation(error.into())
    }
}

/// A violation of the delivery tracking protocol.
///
/// These indicate a bug in a pipeline stage. They are logged and reported, but never abort the
/// pipeline.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TrackingProtocolError {
    /// The id was never tracked or has already been resolved.
    #[error("unknown tracking id {0}")]
    UnknownId(TrackingId),
    /// An outcome arrived before obligations were registered.
    #[error("outcome reported for {0} before obligations were registered")]
    NotRegistered(TrackingId),
    /// Obligations were registered twice for the same id.
    #[error("obligations registered twice for {0}")]
    AlreadyRegistered(TrackingId),
    /// More outcomes were reported than obligations registered.
    #[error("more than {registered} outcomes reported for {id}")]
    TooManyOutcomes {
        /// The tracked point.
        id: TrackingId,
        /// The number of registered obligations.
        registered: usize,
    },
}
