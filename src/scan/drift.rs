//! Drift estimation from a filled corrective raster map.
//!
//! The estimate is a background-subtracted, intensity-weighted centroid:
//!
//! 1. `threshold` = the requested percentile of all samples (linear
//!    interpolation between order statistics);
//! 2. `background` = mean of the samples at or below `threshold`;
//! 3. weights = `max(sample - background, 0)`;
//! 4. centroid = Σ coordinate·weight / Σ weight, drift = centroid − centre.
//!
//! A map with no weight left after subtraction has no defined centroid and
//! yields [`DaqError::NoSignal`].

use super::raster::RasterMap;
use crate::core::Vector2;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// Default percentile used to estimate the background floor.
pub const DEFAULT_BACKGROUND_PERCENTILE: f64 = 20.0;

/// Relative weight below which a map is treated as signal-free.
const NO_SIGNAL_TOLERANCE: f64 = 1e-9;

/// Result of a successful drift estimate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriftEstimate {
    /// Intensity-weighted centroid
    pub centroid: Vector2,
    /// Centroid minus map centre
    pub drift: Vector2,
    /// Centre of the map the estimate was computed on
    pub centre: Vector2,
    /// Estimated background floor
    pub background: f64,
    /// Smallest sample
    pub min: f64,
    /// Largest sample
    pub max: f64,
    /// Σ weight after background subtraction
    pub total_signal: f64,
}

impl DriftEstimate {
    /// Fraction of the peak that is signal rather than background,
    /// `(max - bg) / max`. Zero for a non-positive peak.
    pub fn signal_ratio(&self) -> f64 {
        if self.max > 0.0 {
            ((self.max - self.background) / self.max).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Percentile of `values` with linear interpolation, `pct` in `[0, 100]`.
/// Returns `None` for an empty slice.
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = pct.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

/// Estimates the drift of the brightest feature in `map` from its centre.
///
/// # Errors
/// Returns [`DaqError::NoSignal`] if nothing remains after background
/// subtraction, and [`DaqError::InvalidMap`] if the map holds non-finite samples.
pub fn estimate_drift(map: &RasterMap, background_percentile: f64) -> AppResult<DriftEstimate> {
    let data = map.data();
    if data.iter().any(|v| !v.is_finite()) {
        return Err(DaqError::InvalidMap("map contains non-finite samples".into()));
    }
    let threshold = percentile(data, background_percentile)
        .ok_or_else(|| DaqError::InvalidMap("map has no samples".into()))?;

    let (floor_sum, floor_count) = data
        .iter()
        .filter(|&&v| v <= threshold)
        .fold((0.0, 0usize), |(sum, n), &v| (sum + v, n + 1));
    let background = floor_sum / floor_count as f64;

    let mut total = 0.0;
    let mut weighted = Vector2::ZERO;
    for (_, coordinate, value) in map.samples() {
        let weight = (value - background).max(0.0);
        total += weight;
        weighted += coordinate * weight;
    }

    let min = map.min();
    let max = map.max();
    let scale = max.abs().max(background.abs()) * data.len() as f64;
    if total <= 0.0 || total <= NO_SIGNAL_TOLERANCE * scale {
        return Err(DaqError::NoSignal { total });
    }

    let centroid = Vector2::new(weighted.x / total, weighted.y / total);
    Ok(DriftEstimate {
        centroid,
        drift: centroid - map.centre(),
        centre: map.centre(),
        background,
        min,
        max,
        total_signal: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Cell, GridShape};

    fn filled(rows: usize, cols: usize, fill: f64) -> RasterMap {
        let mut map =
            RasterMap::new(GridShape::new(rows, cols), Vector2::splat(1.0), Vector2::ZERO).unwrap();
        for r in 0..rows {
            for c in 0..cols {
                map.set(Cell::new(r, c), fill).unwrap();
            }
        }
        map
    }

    fn assert_close(a: Vector2, b: Vector2) {
        assert!(a.distance(b) < 1e-9, "{a} != {b}");
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = [4.0, 1.0, 3.0, 2.0, 5.0];
        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&values, 50.0), Some(3.0));
        assert_eq!(percentile(&values, 100.0), Some(5.0));
        assert_eq!(percentile(&values, 20.0), Some(1.8));
        assert_eq!(percentile(&[], 20.0), None);
    }

    #[test]
    fn test_centred_peak_has_no_drift() {
        let mut map = filled(3, 3, 10.0);
        map.set(Cell::new(1, 1), 100.0).unwrap();
        let estimate = estimate_drift(&map, DEFAULT_BACKGROUND_PERCENTILE).unwrap();
        assert_eq!(estimate.background, 10.0);
        assert_close(estimate.drift, Vector2::ZERO);
        assert!((estimate.signal_ratio() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_single_bright_cell_is_the_centroid() {
        let mut map =
            RasterMap::new(GridShape::new(4, 5), Vector2::new(0.5, 0.25), Vector2::new(3.0, 1.0))
                .unwrap();
        let cell = Cell::new(3, 1);
        map.set(cell, 80.0).unwrap();
        let estimate = estimate_drift(&map, DEFAULT_BACKGROUND_PERCENTILE).unwrap();
        assert_close(estimate.centroid, map.coordinate(cell));
        assert_close(estimate.drift, map.coordinate(cell) - map.centre());
    }

    #[test]
    fn test_off_centre_pair_pulls_centroid_between_them() {
        let mut map = filled(3, 3, 5.0);
        map.set(Cell::new(0, 2), 25.0).unwrap();
        map.set(Cell::new(1, 2), 25.0).unwrap();
        let estimate = estimate_drift(&map, DEFAULT_BACKGROUND_PERCENTILE).unwrap();
        assert_close(estimate.drift, Vector2::new(1.0, -0.5));
    }

    #[test]
    fn test_uniform_map_reports_no_signal() {
        let map = filled(3, 3, 12.0);
        let err = estimate_drift(&map, DEFAULT_BACKGROUND_PERCENTILE).unwrap_err();
        assert!(matches!(err, DaqError::NoSignal { .. }));
    }

    #[test]
    fn test_empty_counts_report_no_signal() {
        let map = filled(2, 2, 0.0);
        assert!(matches!(
            estimate_drift(&map, DEFAULT_BACKGROUND_PERCENTILE),
            Err(DaqError::NoSignal { .. })
        ));
    }

    #[test]
    fn test_small_magnitude_maps_still_find_signal() {
        // Rates in MHz: background 1e-6, one bright cell.
        let mut map = filled(3, 3, 1e-6);
        map.set(Cell::new(0, 2), 5e-6).unwrap();
        let estimate = estimate_drift(&map, DEFAULT_BACKGROUND_PERCENTILE).unwrap();
        assert_close(estimate.drift, Vector2::new(1.0, -1.0));
        assert!((estimate.signal_ratio() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_samples_are_rejected() {
        let mut map = filled(2, 2, 1.0);
        map.set(Cell::new(0, 0), f64::NAN).unwrap();
        assert!(matches!(
            estimate_drift(&map, DEFAULT_BACKGROUND_PERCENTILE),
            Err(DaqError::InvalidMap(_))
        ));
    }
}
