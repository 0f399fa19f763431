//! Aggregation algorithms.
//!
//! An [`Aggregation`] folds points of one window into internal state, emits aggregates when the
//! window closes, and is reset afterwards. Algorithms are driven exclusively by a
//! [`RunningAggregator`](crate::RunningAggregator), which serializes all calls.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, PushError};
use crate::point::{DataPoint, FieldValue, Fields, SeriesKey, Tags};

/// An aggregation algorithm.
///
/// Implementations must not keep references to input points past [`reset`](Self::reset).
pub trait Aggregation: Send {
    /// Validates the algorithm's own settings. Called once before the aggregator starts.
    fn init(&mut self) -> Result<(), ConfigurationError> {
        Ok(())
    }

    /// Folds a point into the current window.
    fn add(&mut self, point: &DataPoint);

    /// Emits the aggregates of the window that just closed.
    fn push(&mut self, out: &mut AggregateOutput) -> Result<(), PushError>;

    /// Clears all state. Called after every push, including failed ones.
    fn reset(&mut self);
}

/// Collects the aggregates of one closed window.
#[derive(Debug)]
pub struct AggregateOutput {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    points: Vec<DataPoint>,
}

impl AggregateOutput {
    pub(crate) fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            points: Vec::new(),
        }
    }

    /// Start of the closed window.
    pub fn window_start(&self) -> DateTime<Utc> {
        self.start
    }

    /// End of the closed window.
    pub fn window_end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Emits an aggregate stamped with the start of the closed window.
    pub fn add_fields(&mut self, name: impl Into<String>, tags: Tags, fields: Fields) {
        if fields.is_empty() {
            return;
        }

        self.points.push(DataPoint::new(name, tags, fields, self.start));
    }

    /// Emits an aggregate with a timestamp chosen by the algorithm.
    pub fn add_point(&mut self, point: DataPoint) {
        if !point.fields.is_empty() {
            self.points.push(point.detached());
        }
    }

    pub(crate) fn into_points(self) -> Vec<DataPoint> {
        self.points
    }
}

fn numeric_fields(point: &DataPoint) -> impl Iterator<Item = (&String, f64)> {
    point
        .fields
        .iter()
        .filter_map(|(key, value)| Some((key, value.as_f64()?)))
}

/// Sums numeric fields per series.
#[derive(Debug, Default)]
pub struct Sum {
    series: BTreeMap<SeriesKey, BTreeMap<String, f64>>,
}

impl Aggregation for Sum {
    fn add(&mut self, point: &DataPoint) {
        let sums = self.series.entry(point.series_key()).or_default();
        for (key, value) in numeric_fields(point) {
            *sums.entry(key.clone()).or_default() += value;
        }
    }

    fn push(&mut self, out: &mut AggregateOutput) -> Result<(), PushError> {
        for (series, sums) in &self.series {
            let fields = sums
                .iter()
                .map(|(key, sum)| (key.clone(), FieldValue::Float(*sum)))
                .collect();
            out.add_fields(series.name.clone(), series.tags.clone(), fields);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.series.clear();
    }
}

#[derive(Clone, Copy, Debug)]
struct Bounds {
    min: f64,
    max: f64,
}

/// Tracks the minimum and maximum of numeric fields per series.
///
/// Emits `<field>_min` and `<field>_max`.
#[derive(Debug, Default)]
pub struct MinMax {
    series: BTreeMap<SeriesKey, BTreeMap<String, Bounds>>,
}

impl Aggregation for MinMax {
    fn add(&mut self, point: &DataPoint) {
        let fields = self.series.entry(point.series_key()).or_default();
        for (key, value) in numeric_fields(point) {
            fields
                .entry(key.clone())
                .and_modify(|bounds| {
                    bounds.min = bounds.min.min(value);
                    bounds.max = bounds.max.max(value);
                })
                .or_insert(Bounds {
                    min: value,
                    max: value,
                });
        }
    }

    fn push(&mut self, out: &mut AggregateOutput) -> Result<(), PushError> {
        for (series, bounds) in &self.series {
            let mut fields = Fields::new();
            for (key, bounds) in bounds {
                fields.insert(format!("{key}_min"), bounds.min.into());
                fields.insert(format!("{key}_max"), bounds.max.into());
            }
            out.add_fields(series.name.clone(), series.tags.clone(), fields);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.series.clear();
    }
}

/// A statistic computed by [`BasicStats`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stat {
    Count,
    Min,
    Max,
    Mean,
    Sum,
}

impl Stat {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "count" => Self::Count,
            "min" => Self::Min,
            "max" => Self::Max,
            "mean" => Self::Mean,
            "sum" => Self::Sum,
            _ => return None,
        })
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Mean => "mean",
            Self::Sum => "sum",
        }
    }
}

/// Options of the [`BasicStats`] aggregation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicStatsConfig {
    /// Statistics to emit, out of `count`, `min`, `max`, `mean` and `sum`.
    ///
    /// Defaults to `count`, `min`, `max` and `mean`.
    pub stats: Vec<String>,
}

impl Default for BasicStatsConfig {
    fn default() -> Self {
        Self {
            stats: ["count", "min", "max", "mean"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Running {
    count: u64,
    min: f64,
    max: f64,
    sum: f64,
}

impl Running {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            min: value,
            max: value,
            sum: value,
        }
    }

    fn insert(&mut self, value: f64) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
    }

    fn get(&self, stat: Stat) -> FieldValue {
        match stat {
            Stat::Count => FieldValue::Uint(self.count),
            Stat::Min => FieldValue::Float(self.min),
            Stat::Max => FieldValue::Float(self.max),
            Stat::Mean => FieldValue::Float(self.sum / self.count as f64),
            Stat::Sum => FieldValue::Float(self.sum),
        }
    }
}

/// Computes a configurable set of statistics of numeric fields per series.
///
/// Emits `<field>_<stat>` for every configured statistic.
#[derive(Debug, Default)]
pub struct BasicStats {
    config: BasicStatsConfig,
    stats: Vec<Stat>,
    series: BTreeMap<SeriesKey, BTreeMap<String, Running>>,
}

impl BasicStats {
    /// Creates the aggregation from its options.
    pub fn new(config: BasicStatsConfig) -> Self {
        Self {
            config,
            stats: Vec::new(),
            series: BTreeMap::new(),
        }
    }
}

impl Aggregation for BasicStats {
    fn init(&mut self) -> Result<(), ConfigurationError> {
        self.stats = self
            .config
            .stats
            .iter()
            .map(|name| {
                Stat::parse(name)
                    .ok_or_else(|| ConfigurationError::invalid(format!("unknown stat {name:?}")))
            })
            .collect::<Result<_, _>>()?;

        Ok(())
    }

    fn add(&mut self, point: &DataPoint) {
        let fields = self.series.entry(point.series_key()).or_default();
        for (key, value) in numeric_fields(point) {
            fields
                .entry(key.clone())
                .and_modify(|running| running.insert(value))
                .or_insert_with(|| Running::new(value));
        }
    }

    fn push(&mut self, out: &mut AggregateOutput) -> Result<(), PushError> {
        for (series, running) in &self.series {
            let mut fields = Fields::new();
            for (key, running) in running {
                for &stat in &self.stats {
                    fields.insert(format!("{key}_{}", stat.suffix()), running.get(stat));
                }
            }
            out.add_fields(series.name.clone(), series.tags.clone(), fields);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.series.clear();
    }
}
