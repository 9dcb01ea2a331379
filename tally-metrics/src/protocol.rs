use std::borrow::Cow;
use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[doc(inline)]
pub use tally_common::UnixTimestamp;

use crate::aggregate::Aggregate;

/// Tags attached to a measurement or a batch, sorted by key.
pub type MetricTags = BTreeMap<String, String>;

/// Characters not allowed in measurement names.
static INVALID_NAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9.:_-]").expect("valid name pattern"));

/// Replaces every character outside of `[A-Za-z0-9.:_-]` with an underscore.
///
/// # Example
///
/// ```
/// assert_eq!(tally_metrics::sanitize_name("api latency/ms"), "api_latency_ms");
/// assert_eq!(tally_metrics::sanitize_name("cpu.load_1m"), "cpu.load_1m");
/// ```
pub fn sanitize_name(name: &str) -> Cow<'_, str> {
    INVALID_NAME_CHARS.replace_all(name, "_")
}

/// The summary statistics of an aggregated measurement.
///
/// Fields that are zero are left out on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Summary {
    /// Sum of all observed values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    /// Number of observed values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Smallest observed value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Largest observed value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Most recently observed value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<f64>,
}

impl Summary {
    /// Creates a summary from an aggregate, dropping all zero fields.
    pub fn from_aggregate(aggregate: &Aggregate) -> Self {
        let non_zero = |value: f64| (value != 0.0).then_some(value);

        Self {
            sum: non_zero(aggregate.sum),
            count: (aggregate.count != 0).then_some(aggregate.count),
            min: non_zero(aggregate.min),
            max: non_zero(aggregate.max),
            last: non_zero(aggregate.last),
        }
    }

    fn fields(&self) -> impl Iterator<Item = (&'static str, Option<f64>)> {
        [
            ("sum", self.sum),
            ("min", self.min),
            ("max", self.max),
            ("last", self.last),
        ]
        .into_iter()
    }
}

/// The value of a [`Measurement`]: either a plain scalar or summary statistics, never both.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MeasurementValue {
    /// A single value, for example a counter total.
    Scalar {
        /// The value.
        value: f64,
    },
    /// Aggregated statistics over many observations.
    Summary(Summary),
}

/// A single record in a [`MeasurementsBatch`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Measurement {
    /// The full name of the measurement, including any namespace prefix.
    pub name: String,
    /// Tags specific to this record.
    #[serde(default, skip_serializing_if = "MetricTags::is_empty")]
    pub tags: MetricTags,
    /// The scalar value or summary.
    #[serde(flatten)]
    pub value: MeasurementValue,
}

impl Measurement {
    /// Creates a measurement with a scalar value and no tags.
    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            tags: MetricTags::new(),
            value: MeasurementValue::Scalar { value },
        }
    }

    /// Creates a measurement with summary statistics and no tags.
    pub fn summary(name: impl Into<String>, summary: Summary) -> Self {
        Self {
            name: name.into(),
            tags: MetricTags::new(),
            value: MeasurementValue::Summary(summary),
        }
    }

    /// Replaces the tags of this measurement.
    pub fn with_tags(mut self, tags: MetricTags) -> Self {
        self.tags = tags;
        self
    }

    /// Adds a single tag to this measurement.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Checks that this measurement can be encoded.
    ///
    /// JSON has no representation for `NaN` or infinite numbers, so records carrying them are
    /// rejected.
    pub fn validate(&self) -> Result<(), MeasurementError> {
        let non_finite = match &self.value {
            MeasurementValue::Scalar { value } => (!value.is_finite()).then_some("value"),
            MeasurementValue::Summary(summary) => summary
                .fields()
                .find(|(_, value)| value.is_some_and(|v| !v.is_finite()))
                .map(|(field, _)| field),
        };

        match non_finite {
            Some(field) => Err(MeasurementError::NonFinite {
                name: self.name.clone(),
                field,
            }),
            None => Ok(()),
        }
    }
}

/// An error returned when a [`Measurement`] cannot be encoded.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum MeasurementError {
    /// A value is `NaN` or infinite.
    #[error("measurement {name:?} has a non-finite {field}")]
    NonFinite {
        /// Name of the offending measurement.
        name: String,
        /// The field holding the non-finite value.
        field: &'static str,
    },
}

/// A payload of measurements handed to a [`DeliverySink`](crate::DeliverySink).
///
/// A batch never holds more measurements than the configured maximum batch size.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MeasurementsBatch {
    /// The flush boundary this batch was produced for.
    pub time: UnixTimestamp,
    /// The flush period in seconds, or `0` if not periodic.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub period: u64,
    /// Tags shared by all measurements in this batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<MetricTags>,
    /// The records of this batch in construction order.
    pub measurements: Vec<Measurement>,
}

impl MeasurementsBatch {
    /// Creates an empty batch for the given time.
    pub fn new(time: UnixTimestamp) -> Self {
        Self {
            time,
            period: 0,
            tags: None,
            measurements: Vec::new(),
        }
    }

    /// Returns the number of measurements.
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    /// Returns `true` if the batch has no measurements.
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Serializes this batch into its JSON wire format.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}
