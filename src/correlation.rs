//! Photon-correlation (HBT) histograms and g2 evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fraction of bins at each end of the histogram treated as the uncorrelated
/// long-delay baseline.
const BASELINE_FRACTION: f64 = 0.1;

/// Start-stop coincidence histogram read from the counter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrelationHistogram {
    /// Delay at the centre of each bin, in nanoseconds.
    pub bin_centres_ns: Vec<f64>,
    /// Coincidences per bin.
    pub counts: Vec<f64>,
    /// Accumulation time covered by `counts`.
    #[serde(with = "humantime_serde")]
    pub integration_time: Duration,
    /// When the histogram was read.
    pub acquired_at: DateTime<Utc>,
}

impl CorrelationHistogram {
    /// Histogram stamped with the current time.
    pub fn new(bin_centres_ns: Vec<f64>, counts: Vec<f64>, integration_time: Duration) -> Self {
        Self {
            bin_centres_ns,
            counts,
            integration_time,
            acquired_at: Utc::now(),
        }
    }

    /// Number of bins.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// True when there are no bins.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Total coincidences.
    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }

    /// Mean of the outer bins on both sides, or of all bins if the histogram
    /// is too short to have a baseline.
    pub fn baseline(&self) -> f64 {
        let n = self.counts.len();
        if n == 0 {
            return 0.0;
        }
        let edge = (n as f64 * BASELINE_FRACTION).floor() as usize;
        if edge == 0 {
            return self.total() / n as f64;
        }
        let sum: f64 = self.counts[..edge].iter().chain(&self.counts[n - edge..]).sum();
        sum / (2 * edge) as f64
    }

    /// g2(τ) for every bin.
    ///
    /// With `normalise`, counts are divided by [`baseline`](Self::baseline).
    /// With `correct`, uncorrelated background is removed using the
    /// signal-to-total ratio ρ: `g2' = (g2 - (1 - ρ²)) / ρ²`. Correction is
    /// skipped for a non-positive ρ.
    pub fn g2(&self, normalise: bool, correct: bool, signal_ratio: f64) -> Vec<f64> {
        let norm = if normalise { self.baseline() } else { 1.0 };
        let norm = if norm > 0.0 { norm } else { 1.0 };
        let rho_sq = signal_ratio.clamp(0.0, 1.0).powi(2);

        self.counts
            .iter()
            .map(|&c| {
                let g = c / norm;
                if correct && rho_sq > 0.0 {
                    (g - (1.0 - rho_sq)) / rho_sq
                } else {
                    g
                }
            })
            .collect()
    }

    /// Smallest g2 value and the delay at which it occurs.
    pub fn dip(&self, normalise: bool, correct: bool, signal_ratio: f64) -> Option<(f64, f64)> {
        self.g2(normalise, correct, signal_ratio)
            .into_iter()
            .zip(self.bin_centres_ns.iter().copied())
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(g, tau)| (tau, g))
    }
}
