//! Per-channel rate-of-change tracking over a time-windowed ring buffer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Hard cap on buffered samples, independent of the time window, as a
/// backstop against a misbehaving clock or a pathologically long window
/// combined with a very fast poll interval.
const MAX_BUFFERED_SAMPLES: usize = 4096;

/// Default minimum span between the oldest and newest sample before a rate
/// is reported, avoiding division by a near-zero interval.
pub const DEFAULT_MIN_SAMPLE_SPAN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    raw: f64,
}

/// Tracks `(timestamp, raw_value)` samples for one `(device_id,
/// channel_number)` pair and derives a rate of change, handling counter
/// rollover for channels that wrap at a fixed bit width.
#[derive(Debug, Clone)]
pub struct RateEngine {
    window: Duration,
    min_sample_span: Duration,
    rollover_bits: Option<u32>,
    samples: VecDeque<Sample>,
}

impl RateEngine {
    /// Build a rate engine retaining samples for `window`, reporting a rate
    /// only once the oldest and newest sample are at least
    /// `DEFAULT_MIN_SAMPLE_SPAN` apart. `rollover_bits` enables counter wrap
    /// handling at that bit width; pass `None` for non-wrapping channels
    /// (scales).
    #[must_use]
    pub fn new(window: Duration, rollover_bits: Option<u32>) -> Self {
        Self {
            window,
            min_sample_span: DEFAULT_MIN_SAMPLE_SPAN,
            rollover_bits,
            samples: VecDeque::new(),
        }
    }

    /// Override the minimum sample span (primarily for tests).
    #[must_use]
    pub fn with_min_sample_span(mut self, span: Duration) -> Self {
        self.min_sample_span = span;
        self
    }

    /// Record a new raw sample and return the current rate, in
    /// units/second, if enough history is retained.
    pub fn record(&mut self, raw: f64) -> Option<f64> {
        let now = Instant::now();
        self.samples.push_back(Sample { at: now, raw });

        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > MAX_BUFFERED_SAMPLES {
            self.samples.pop_front();
        }

        if self.samples.len() < 2 {
            return None;
        }

        let oldest = *self.samples.front().expect("checked len >= 2");
        let newest = *self.samples.back().expect("checked len >= 2");
        let span = newest.at.duration_since(oldest.at);
        if span < self.min_sample_span {
            return None;
        }

        let delta = self.delta_with_rollover(oldest.raw, newest.raw);
        Some(delta / span.as_secs_f64())
    }

    fn delta_with_rollover(&self, oldest: f64, newest: f64) -> f64 {
        let Some(bits) = self.rollover_bits else {
            return newest - oldest;
        };
        let range = 2f64.powi(bits as i32);
        let lower_bound = range / 2.0;
        if newest < oldest && oldest > lower_bound {
            (newest + range) - oldest
        } else {
            newest - oldest
        }
    }
}
