//! Transformation of points before aggregation and output.

use std::error::Error;

use serde::{Deserialize, Serialize};
use sluice_log::Level;

use crate::config::ProcessorConfig;
use crate::error::{ConfigurationError, ConfigurationErrorKind};
use crate::filter::{Filter, IncludeExclude};
use crate::point::{DataPoint, FieldValue};

/// A transformation applied to every point in order.
///
/// Processors receive owned points and may change them in place. Returning `None` drops the point.
/// Tracking is carried by the point itself, so a processor that returns its input keeps it.
pub trait Processor: Send + Sync {
    /// Validates the processor's own settings.
    fn init(&mut self) -> Result<(), ConfigurationError> {
        Ok(())
    }

    /// Transforms a point.
    fn apply(&mut self, point: DataPoint) -> Option<DataPoint>;
}

/// A processor bound to its filter and position in the chain.
pub struct RunningProcessor {
    name: String,
    config: ProcessorConfig,
    filter: Filter,
    processor: Box<dyn Processor>,
}

impl RunningProcessor {
    /// Wraps a processor. It must be initialized before use.
    pub fn new(processor: Box<dyn Processor>, config: ProcessorConfig) -> Self {
        Self {
            name: config.instance_name(),
            filter: Filter::lazy(config.filter.clone()),
            config,
            processor,
        }
    }

    /// Compiles the filter and initializes the processor.
    pub fn init(&mut self) -> Result<(), ConfigurationError> {
        let result = Filter::new(self.config.filter.clone()).and_then(|filter| {
            self.filter = filter;
            self.processor.init()
        });

        result.map_err(|error| error.with_instance(self.name.as_str()))
    }

    /// Returns the name of this instance used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the position of this processor in the chain.
    pub fn order(&self) -> i64 {
        self.config.order
    }

    /// Applies the processor to a selected point. Other points pass through unchanged.
    pub fn apply(&mut self, mut point: DataPoint) -> Option<DataPoint> {
        match self.filter.select(&point) {
            Ok(true) => (),
            Ok(false) => return Some(point),
            Err(error) => {
                if self.logs(Level::Error) {
                    sluice_log::error!(
                        error = &error as &dyn Error,
                        processor = self.name(),
                        "filtering failed"
                    );
                }
                return Some(point);
            }
        }

        if self.filter.modify(&mut point).is_err() || point.fields.is_empty() {
            return None;
        }

        self.processor.apply(point)
    }

    fn logs(&self, level: Level) -> bool {
        self.config.log_level.is_none_or(|max| max.allows(level))
    }
}

impl std::fmt::Debug for RunningProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningProcessor")
            .field("name", &self.name)
            .field("order", &self.config.order)
            .finish_non_exhaustive()
    }
}

/// Options of the [`Round`] processor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Number of decimal places to keep.
    ///
    /// Defaults to `0`. Negative values round to tens, hundreds and so on, and then apply to
    /// integer fields as well. Must lie within `-18..=15`.
    pub precision: i32,
    /// Fields to round. Defaults to all fields.
    pub fields: Vec<String>,
    /// Fields never to round.
    pub fields_exclude: Vec<String>,
}

/// Rounds numeric fields to a fixed number of decimal places.
///
/// Rounding is half away from zero. With a non-negative precision only floats are rounded, since
/// integers are already exact.
#[derive(Debug, Default)]
pub struct Round {
    config: RoundConfig,
    fields: IncludeExclude,
}

impl Round {
    /// Creates the processor from its options.
    pub fn new(config: RoundConfig) -> Self {
        Self {
            config,
            fields: IncludeExclude::default(),
        }
    }

    fn round(&self, value: &mut FieldValue) {
        let precision = self.config.precision;
        match value {
            FieldValue::Float(v) => *v = round_float(*v, precision),
            FieldValue::Int(v) if precision < 0 => *v = round_int(*v, precision.unsigned_abs()),
            FieldValue::Uint(v) if precision < 0 => *v = round_uint(*v, precision.unsigned_abs()),
            _ => (),
        }
    }
}

impl Processor for Round {
    fn init(&mut self) -> Result<(), ConfigurationError> {
        if !(-18..=15).contains(&self.config.precision) {
            return Err(ConfigurationError::invalid(format!(
                "precision {} is out of range -18..=15",
                self.config.precision
            )));
        }

        self.fields = IncludeExclude::new(&self.config.fields, &self.config.fields_exclude)
            .map_err(ConfigurationErrorKind::from)?;

        Ok(())
    }

    fn apply(&mut self, mut point: DataPoint) -> Option<DataPoint> {
        for (key, value) in point.fields.iter_mut() {
            if self.fields.matches(key) {
                self.round(value);
            }
        }
        Some(point)
    }
}

fn round_float(value: f64, precision: i32) -> f64 {
    let factor = 10f64.powi(precision);
    (value * factor).round() / factor
}

fn round_int(value: i64, digits: u32) -> i64 {
    let factor = 10i64.pow(digits);
    let quotient = value / factor;
    let remainder = value % factor;

    let rounded = if remainder.unsigned_abs() * 2 >= factor.unsigned_abs() {
        quotient + value.signum()
    } else {
        quotient
    };

    rounded.saturating_mul(factor)
}

fn round_uint(value: u64, digits: u32) -> u64 {
    let factor = 10u64.pow(digits);
    let quotient = value / factor;

    let rounded = if (value % factor) * 2 >= factor {
        quotient + 1
    } else {
        quotient
    };

    rounded.saturating_mul(factor)
}
