use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// The logging level parsed from configuration.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// The "error" level.
    ///
    /// Designates very serious errors.
    Error,
    /// The "warn" level.
    ///
    /// Designates hazardous situations.
    Warn,
    /// The "info" level.
    ///
    /// Designates useful information.
    #[default]
    Info,
    /// The "debug" level.
    ///
    /// Designates lower priority information.
    Debug,
    /// The "trace" level.
    ///
    /// Designates very low priority, often extremely verbose, information.
    Trace,
    /// Completely disables logging.
    Off,
}

impl Level {
    /// Returns the tracing [`LevelFilter`].
    pub const fn level_filter(&self) -> LevelFilter {
        match self {
            Level::Error => LevelFilter::ERROR,
            Level::Warn => LevelFilter::WARN,
            Level::Info => LevelFilter::INFO,
            Level::Debug => LevelFilter::DEBUG,
            Level::Trace => LevelFilter::TRACE,
            Level::Off => LevelFilter::OFF,
        }
    }

    /// Returns `true` if messages at `level` pass this configured maximum level.
    ///
    /// # Example
    ///
    /// ```
    /// use sluice_log::Level;
    ///
    /// assert!(Level::Info.enables(tracing::Level::WARN));
    /// assert!(!Level::Info.enables(tracing::Level::DEBUG));
    /// ```
    pub fn enables(self, level: tracing::Level) -> bool {
        self.level_filter() >= level
    }

    /// Returns `true` if messages at the configured level `other` pass this maximum level.
    ///
    /// Used for per-instance caps, where both sides come from configuration.
    pub fn allows(self, other: Level) -> bool {
        other != Level::Off && self.level_filter() >= other.level_filter()
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level_filter())
    }
}
