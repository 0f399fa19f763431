//! The data model carried through the pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tracking::TrackingId;

/// Tags of a [`DataPoint`], ordered by key.
pub type Tags = BTreeMap<String, String>;

/// Fields of a [`DataPoint`], ordered by key.
pub type Fields = BTreeMap<String, FieldValue>;

/// The value of a single field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// A signed integer.
    Int(i64),
    /// An unsigned integer.
    Uint(u64),
    /// A floating point number.
    Float(f64),
    /// A boolean.
    Bool(bool),
    /// A string.
    String(String),
}

impl FieldValue {
    /// Returns the value as `f64` for numeric fields.
    ///
    /// Booleans and strings are not numeric and return `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Int(v) => Some(v as f64),
            Self::Uint(v) => Some(v as f64),
            Self::Float(v) => Some(v),
            Self::Bool(_) | Self::String(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}i"),
            Self::Uint(v) => write!(f, "{v}u"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        Self::Uint(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// Identity of a series: the measurement name and its full tag set.
///
/// Aggregation algorithms group points by this key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    /// The measurement name.
    pub name: String,
    /// All tags of the series.
    pub tags: Tags,
}

/// A single measurement.
///
/// Points are immutable by convention once they enter the pipeline: stages that change a point
/// work on their own copy. The only exception is a processor, which receives an owned point.
///
/// A point may carry a [`TrackingId`] if its producer wants to learn about delivery. Cloning a
/// point keeps the tracking identity, [`DataPoint::detached`] drops it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// The measurement name.
    pub name: String,
    /// Tags of this point.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: Tags,
    /// Fields of this point. Never empty once the point is accepted by an accumulator.
    pub fields: Fields,
    /// The time of the measurement.
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    tracking: Option<TrackingId>,
}

impl DataPoint {
    /// Creates a new untracked point.
    pub fn new(
        name: impl Into<String>,
        tags: Tags,
        fields: Fields,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            tags,
            fields,
            timestamp,
            tracking: None,
        }
    }

    /// Returns the tracking identity of this point, if it is tracked.
    pub fn tracking_id(&self) -> Option<TrackingId> {
        self.tracking
    }

    /// Returns `true` if the producer of this point waits for its delivery.
    pub fn is_tracked(&self) -> bool {
        self.tracking.is_some()
    }

    pub(crate) fn set_tracking(&mut self, id: TrackingId) {
        self.tracking = Some(id);
    }

    /// Returns a copy of this point without tracking.
    ///
    /// Holding on to a detached copy never delays the delivery notification of the original.
    pub fn detached(&self) -> Self {
        Self {
            name: self.name.clone(),
            tags: self.tags.clone(),
            fields: self.fields.clone(),
            timestamp: self.timestamp,
            tracking: None,
        }
    }

    /// Returns the series this point belongs to.
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey {
            name: self.name.clone(),
            tags: self.tags.clone(),
        }
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (key, value) in &self.tags {
            write!(f, ",{key}={value}")?;
        }
        for (index, (key, value)) in self.fields.iter().enumerate() {
            let separator = if index == 0 { ' ' } else { ',' };
            write!(f, "{separator}{key}={value}")?;
        }
        write!(f, " {}", self.timestamp.timestamp_nanos_opt().unwrap_or_default())
    }
}
