//! Count, Gauge and Summary metrics and their wire encoding.
//!
//! Metrics are encoded to raw JSON as soon as they are recorded, so the
//! pending buffer holds `Box<RawValue>`s rather than metric structs. A
//! timestamp or interval left as `None` is omitted from the metric object and
//! supplied by the batch's `common` block at harvest time.

use crate::attributes::{to_raw, vet_attributes, Attributes};
use crate::error::{AttributeError, MetricError};
use crate::timestamp::{duration_millis, epoch_millis};
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Number;
use std::time::{Duration, SystemTime};

/// Largest integer an f64 holds exactly (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// A monotonic delta accumulated over `interval`.
#[derive(Debug, Clone, Default)]
pub struct Count {
    pub name: String,
    pub attributes: Attributes,
    /// Pre-serialized attributes object. Takes precedence over `attributes`
    /// and is not validated.
    pub attributes_json: Option<Box<RawValue>>,
    pub value: f64,
    pub timestamp: Option<SystemTime>,
    pub interval: Option<Duration>,
}

/// An instantaneous value.
#[derive(Debug, Clone, Default)]
pub struct Gauge {
    pub name: String,
    pub attributes: Attributes,
    pub attributes_json: Option<Box<RawValue>>,
    pub value: f64,
    pub timestamp: Option<SystemTime>,
}

/// Aggregated observations over `interval`.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub name: String,
    pub attributes: Attributes,
    pub attributes_json: Option<Box<RawValue>>,
    pub count: f64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub timestamp: Option<SystemTime>,
    pub interval: Option<Duration>,
}

/// Any of the three metric kinds.
#[derive(Debug, Clone)]
pub enum Metric {
    Count(Count),
    Gauge(Gauge),
    Summary(Summary),
}

impl From<Count> for Metric {
    fn from(m: Count) -> Self {
        Self::Count(m)
    }
}

impl From<Gauge> for Metric {
    fn from(m: Gauge) -> Self {
        Self::Gauge(m)
    }
}

impl From<Summary> for Metric {
    fn from(m: Summary) -> Self {
        Self::Summary(m)
    }
}

/// Converts a float to a JSON number, writing integral values without a
/// fractional part. Returns `None` for NaN and infinities.
pub(crate) fn json_number(v: f64) -> Option<Number> {
    if !v.is_finite() {
        return None;
    }
    if v.fract() == 0.0 && v.abs() <= MAX_SAFE_INTEGER {
        return Some(Number::from(v as i64));
    }
    Number::from_f64(v)
}

#[derive(Serialize)]
#[serde(untagged)]
enum MetricValue {
    Single(Number),
    Summary {
        sum: Number,
        count: Number,
        min: Number,
        max: Number,
    },
}

#[derive(Serialize)]
struct MetricJson<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    value: MetricValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
    #[serde(rename = "interval.ms", skip_serializing_if = "Option::is_none")]
    interval_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attributes: Option<&'a RawValue>,
}

impl Metric {
    /// Returns the metric name.
    pub fn name(&self) -> &str {
        match self {
            Self::Count(m) => &m.name,
            Self::Gauge(m) => &m.name,
            Self::Summary(m) => &m.name,
        }
    }

    /// Returns the wire `type` of the metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Count(_) => "count",
            Self::Gauge(_) => "gauge",
            Self::Summary(_) => "summary",
        }
    }

    fn parts(
        &self,
    ) -> (
        &Attributes,
        Option<&RawValue>,
        Option<SystemTime>,
        Option<Duration>,
    ) {
        match self {
            Self::Count(m) => (
                &m.attributes,
                m.attributes_json.as_deref(),
                m.timestamp,
                m.interval,
            ),
            Self::Gauge(m) => (&m.attributes, m.attributes_json.as_deref(), m.timestamp, None),
            Self::Summary(m) => (
                &m.attributes,
                m.attributes_json.as_deref(),
                m.timestamp,
                m.interval,
            ),
        }
    }

    fn value(&self) -> Option<MetricValue> {
        match self {
            Self::Count(m) => json_number(m.value).map(MetricValue::Single),
            Self::Gauge(m) => json_number(m.value).map(MetricValue::Single),
            Self::Summary(m) => Some(MetricValue::Summary {
                sum: json_number(m.sum)?,
                count: json_number(m.count)?,
                min: json_number(m.min)?,
                max: json_number(m.max)?,
            }),
        }
    }

    /// Vets and encodes the metric into its raw JSON object.
    ///
    /// Dropped attributes are returned alongside the encoded metric; a
    /// non-finite value rejects the whole metric.
    pub fn encode(&self) -> Result<(Box<RawValue>, Vec<AttributeError>), MetricError> {
        let value = self.value().ok_or_else(|| MetricError::NonFinite {
            name: self.name().to_string(),
        })?;
        let (attributes, attributes_json, timestamp, interval) = self.parts();

        let (vetted_raw, errors) = match attributes_json {
            Some(_) => (None, Vec::new()),
            None => {
                let (vetted, errors) = vet_attributes(attributes);
                (to_raw(&vetted), errors)
            }
        };

        let js = MetricJson {
            name: self.name(),
            kind: self.kind(),
            value,
            timestamp: timestamp.map(epoch_millis),
            interval_ms: interval.map(duration_millis),
            attributes: attributes_json.or(vetted_raw.as_deref()),
        };

        let raw = serde_json::value::to_raw_value(&js).map_err(|e| MetricError::Encode {
            name: self.name().to_string(),
            reason: e.to_string(),
        })?;
        Ok((raw, errors))
    }
}
