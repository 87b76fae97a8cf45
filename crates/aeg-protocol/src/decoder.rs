//! Turns raw register words or raw ASCII scale frames into typed readings.

use acq_common::error::{EngineError, EngineResult};
use acq_common::{CounterChannelConfig, ScaleChannelConfig};
use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::templates::ProtocolTemplate;

/// A decoded counter reading, before validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterDecoded {
    /// Combined raw register value, pre-scale, kept for overflow/rate checks.
    pub raw: u64,
    /// `raw * scale_factor + offset`, truncated to an integer.
    pub scaled: i64,
}

/// Combine `register_count` 16-bit words into an unsigned integer.
///
/// The first register holds the least-significant word even though each
/// register's own two bytes arrive big-endian on the wire (§4.2); this
/// word-order convention is what makes multi-register counters decode
/// consistently across the fleet.
#[must_use]
pub fn decode_counter(registers: &[u16], channel: &CounterChannelConfig) -> CounterDecoded {
    let mut raw: u64 = 0;
    for (i, word) in registers.iter().enumerate() {
        raw |= u64::from(*word) << (16 * i);
    }
    let scaled = (raw as f64).mul_add(channel.scale_factor, channel.offset);
    CounterDecoded {
        raw,
        scaled: scaled.trunc() as i64,
    }
}

/// A decoded scale (weight) reading, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleDecoded {
    /// Parsed decimal weight, rounded to the channel's configured precision.
    pub value: Decimal,
    /// Engineering unit, from a named capture or the template/channel default.
    pub unit: String,
    /// True if the device reported the reading as motionless.
    pub stable: bool,
}

/// Parse `frame` against `template.weight_pattern` and determine stability
/// from the template's motion/stable markers.
pub fn decode_scale(
    frame: &str,
    template: &ProtocolTemplate,
    channel: &ScaleChannelConfig,
) -> EngineResult<ScaleDecoded> {
    let caps = template
        .weight_pattern
        .captures(frame)
        .ok_or_else(|| EngineError::DecodeFailed(format!("weight_pattern did not match {frame:?}")))?;

    let raw_number = caps
        .get(1)
        .ok_or_else(|| EngineError::DecodeFailed("weight_pattern missing capture group".to_string()))?
        .as_str();
    let mut value = Decimal::from_str(raw_number)
        .map_err(|e| EngineError::DecodeFailed(format!("invalid weight value {raw_number:?}: {e}")))?;
    value = value.round_dp(u32::from(channel.decimal_places));

    let unit = caps
        .get(2)
        .map(|m| m.as_str().to_string())
        .or_else(|| channel.unit.clone())
        .unwrap_or_else(|| template.unit.clone());

    let stable = determine_stability(frame, template);

    Ok(ScaleDecoded {
        value,
        unit,
        stable,
    })
}

fn determine_stability(frame: &str, template: &ProtocolTemplate) -> bool {
    let has_motion = template
        .motion_markers
        .iter()
        .any(|marker| marker_present(frame, marker));
    if has_motion {
        return false;
    }
    match &template.stable_marker {
        Some(marker) => marker_present(frame, marker),
        None => true,
    }
}

fn marker_present(frame: &str, marker: &str) -> bool {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(marker));
    Regex::new(&pattern)
        .map(|re| re.is_match(frame))
        .unwrap_or(false)
}
