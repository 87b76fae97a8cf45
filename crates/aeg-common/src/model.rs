//! The observation record produced by the acquisition pipeline, and the
//! value types that make it up.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Opaque key-value metadata carried on every observation.
pub type Tags = BTreeMap<String, String>;

/// Trustworthiness label attached to an observation by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Passed all validation rules.
    Good,
    /// Rate of change exceeded the configured bound.
    Uncertain,
    /// Raw value fell outside the configured range.
    Bad,
    /// The read did not complete before its deadline.
    Timeout,
    /// The transport exhausted its retry budget.
    DeviceFailure,
    /// Decoding failed due to a channel misconfiguration.
    ConfigurationError,
    /// Raw value reached or exceeded the overflow threshold.
    Overflow,
}

/// The untouched bytes a channel produced, kept for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// Holding registers as read off the wire, in register order.
    Counter {
        /// Raw 16-bit register words, first register first.
        registers: Vec<u16>,
    },
    /// The raw ASCII/byte frame a scale protocol template matched.
    Scale {
        /// Raw response frame (already stripped of any transport framing).
        frame: String,
    },
}

/// A decoded, typed reading.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    /// A counter reading, after scale/offset have been applied.
    Counter {
        /// Scaled value (`raw * scale_factor + offset`), truncated to an integer.
        value: i64,
        /// Engineering unit (e.g. "count").
        unit: String,
    },
    /// A scale (weight) reading.
    Weight {
        /// Parsed decimal weight value.
        value: Decimal,
        /// Engineering unit (e.g. "kg").
        unit: String,
    },
}

impl DecodedValue {
    /// The value as `f64`, for rate-of-change and validation arithmetic.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Counter { value, .. } => *value as f64,
            Self::Weight { value, .. } => value.try_into().unwrap_or(f64::NAN),
        }
    }

    /// The engineering unit string.
    #[must_use]
    pub fn unit(&self) -> &str {
        match self {
            Self::Counter { unit, .. } | Self::Weight { unit, .. } => unit,
        }
    }
}

/// Immutable record emitted by the pipeline for one channel, once per cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Owning device identity.
    pub device_id: String,
    /// Channel within the device.
    pub channel_number: u16,
    /// Wall-clock time the reading was taken.
    pub timestamp: DateTime<Utc>,
    /// Time spent acquiring this single channel's raw value.
    pub acquisition_duration: Duration,
    /// Untouched raw value, for diagnostics.
    pub raw_value: RawValue,
    /// Typed, scaled value.
    pub decoded_value: DecodedValue,
    /// Rate of change in units/second, present once the rate engine has
    /// enough history.
    pub rate: Option<f64>,
    /// Trustworthiness label.
    pub quality: Quality,
    /// Motion/stability flag, scales only.
    pub stability: Option<bool>,
    /// Device tags union engine-injected `device_id`/`channel` tags.
    pub tags: Tags,
}

impl Observation {
    /// Build the tag set for this observation: device tags plus the
    /// engine-injected `device_id` and `channel` tags.
    #[must_use]
    pub fn with_engine_tags(device_id: &str, channel_number: u16, device_tags: &Tags) -> Tags {
        let mut tags = device_tags.clone();
        tags.insert("device_id".to_string(), device_id.to_string());
        tags.insert("channel".to_string(), channel_number.to_string());
        tags
    }
}
