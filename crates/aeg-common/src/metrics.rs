//! Exponentially weighted moving average used for per-cycle latency tracking.

use std::time::Duration;

/// The smoothing factor used for per-device latency EWMA (glossary: "EWMA latency").
pub const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// A single exponentially weighted moving average accumulator.
///
/// `value = alpha * sample + (1 - alpha) * value`, seeded with the first
/// sample so the average isn't biased toward zero before enough data
/// arrives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    /// Create a new, empty accumulator with the given smoothing factor.
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    /// Fold in a new sample, returning the updated average.
    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
        };
        self.value = Some(next);
        next
    }

    /// Current average, or `0.0` if no sample has been recorded.
    #[must_use]
    pub fn get(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

impl Default for Ewma {
    fn default() -> Self {
        Self::new(LATENCY_EWMA_ALPHA)
    }
}

/// Convenience: fold a cycle duration into a latency EWMA expressed in milliseconds.
pub fn update_latency_ms(ewma: &mut Ewma, duration: Duration) -> f64 {
    ewma.update(duration.as_secs_f64() * 1000.0)
}
