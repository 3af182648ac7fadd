//! Round-trip estimation (Jacobson/Karels, RFC 6298).
//!
//! Samples come from acknowledgements of first transmissions and from pongs
//! answering an outstanding ping. The derived resend timeout seeds the resend
//! interval of new reliable packets when no fixed timeout is configured.

use std::time::Duration;

/// Resend timeout used before the first sample arrives.
const INITIAL_RESEND_TIMEOUT: Duration = Duration::from_millis(500);
/// Floor for the derived resend timeout.
const MIN_RESEND_TIMEOUT: Duration = Duration::from_millis(50);
/// Ceiling for the derived resend timeout.
const MAX_RESEND_TIMEOUT: Duration = Duration::from_secs(10);
/// Clock granularity floor for the variance term.
const GRANULARITY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothed: Option<Duration>,
    variance: Duration,
    resend_timeout: Duration,
    samples: u64,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            smoothed: None,
            variance: Duration::ZERO,
            resend_timeout: INITIAL_RESEND_TIMEOUT,
            samples: 0,
        }
    }

    /// Fold a new round-trip sample into the estimate.
    pub fn update(&mut self, sample: Duration) {
        self.samples += 1;
        let smoothed = match self.smoothed {
            None => {
                self.variance = sample / 2;
                sample
            }
            Some(smoothed) => {
                let deviation = if smoothed > sample {
                    smoothed - sample
                } else {
                    sample - smoothed
                };
                self.variance = (self.variance * 3 + deviation) / 4;
                (smoothed * 7 + sample) / 8
            }
        };
        self.smoothed = Some(smoothed);
        let spread = std::cmp::max(GRANULARITY, self.variance * 4);
        self.resend_timeout = (smoothed + spread).clamp(MIN_RESEND_TIMEOUT, MAX_RESEND_TIMEOUT);
    }

    /// Smoothed round trip, or `None` before the first sample.
    pub fn round_trip(&self) -> Option<Duration> {
        self.smoothed
    }

    pub fn variance(&self) -> Duration {
        self.variance
    }

    /// Resend interval derived from the current estimate.
    pub fn resend_timeout(&self) -> Duration {
        self.resend_timeout
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}
