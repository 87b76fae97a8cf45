//! Assigns a [`Quality`] tag to a reading: range, rate-of-change, and
//! overflow rules, first match wins.

use acq_common::{CounterChannelConfig, Quality, ScaleChannelConfig};

/// The numeric bounds a reading is checked against, in the same domain the
/// reading itself is reported in (raw register units for counters, weight
/// units for scales).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelLimits {
    /// Lower bound; below this the reading is `bad`.
    pub min_value: f64,
    /// Upper bound; above this the reading is `bad`.
    pub max_value: f64,
    /// `|rate|` above this makes the reading `uncertain`.
    pub max_rate_of_change: f64,
    /// At/above this (but within `max_value`) the reading is `overflow`.
    pub overflow_threshold: f64,
}

impl ChannelLimits {
    /// Derive limits from a counter channel's raw-domain configuration.
    #[must_use]
    pub fn for_counter(channel: &CounterChannelConfig) -> Self {
        Self {
            min_value: channel.min_value as f64,
            max_value: channel.max_value as f64,
            max_rate_of_change: channel.max_rate_of_change,
            overflow_threshold: channel.overflow_threshold as f64,
        }
    }

    /// Derive limits from a scale channel's configuration. Scales have no
    /// raw-register overflow concept, so `capacity` plays the role
    /// `overflow_threshold` plays for counters, and a small negative slack
    /// of one `resolution` step tolerates tare/zero-point noise.
    #[must_use]
    pub fn for_scale(channel: &ScaleChannelConfig) -> Self {
        Self {
            min_value: -channel.resolution,
            max_value: channel.capacity + channel.resolution,
            max_rate_of_change: channel.max_rate_of_change,
            overflow_threshold: channel.capacity,
        }
    }
}

/// Apply the four quality rules in priority order to one reading.
#[must_use]
pub fn assign_quality(value: f64, rate: Option<f64>, limits: &ChannelLimits) -> Quality {
    if value < limits.min_value || value > limits.max_value {
        return Quality::Bad;
    }
    if let Some(rate) = rate {
        if rate.abs() > limits.max_rate_of_change {
            return Quality::Uncertain;
        }
    }
    if value >= limits.overflow_threshold {
        return Quality::Overflow;
    }
    Quality::Good
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ChannelLimits {
        ChannelLimits {
            min_value: 0.0,
            max_value: 1000.0,
            max_rate_of_change: 50.0,
            overflow_threshold: 900.0,
        }
    }

    #[test]
    fn in_range_slow_rate_is_good() {
        assert_eq!(assign_quality(500.0, Some(1.0), &limits()), Quality::Good);
    }

    #[test]
    fn below_min_is_bad() {
        assert_eq!(assign_quality(-1.0, None, &limits()), Quality::Bad);
    }

    #[test]
    fn above_max_is_bad() {
        assert_eq!(assign_quality(1001.0, None, &limits()), Quality::Bad);
    }

    #[test]
    fn fast_rate_is_uncertain() {
        assert_eq!(assign_quality(500.0, Some(51.0), &limits()), Quality::Uncertain);
    }

    #[test]
    fn near_max_without_fast_rate_is_overflow() {
        assert_eq!(assign_quality(950.0, Some(1.0), &limits()), Quality::Overflow);
    }

    #[test]
    fn bad_range_takes_priority_over_overflow() {
        // Out of [min, max] entirely, even though it would also clear overflow_threshold.
        assert_eq!(assign_quality(1001.0, Some(1.0), &limits()), Quality::Bad);
    }

    #[test]
    fn rate_check_takes_priority_over_overflow() {
        assert_eq!(
            assign_quality(950.0, Some(100.0), &limits()),
            Quality::Uncertain
        );
    }

    #[test]
    fn scale_limits_tolerate_small_negative_noise() {
        let channel = ScaleChannelConfig {
            capacity: 100.0,
            resolution: 0.01,
            ..ScaleChannelConfig::default()
        };
        let limits = ChannelLimits::for_scale(&channel);
        assert_eq!(assign_quality(-0.005, None, &limits), Quality::Good);
        assert_eq!(assign_quality(-1.0, None, &limits), Quality::Bad);
    }
}
