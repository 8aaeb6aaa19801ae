//! Events published by the scan orchestrator for presentation layers.

use serde::Serialize;

use super::drift::DriftEstimate;
use super::mode::Mode;
use super::raster::RasterMap;
use crate::core::{Cell, Vector2};
use crate::correlation::CorrelationHistogram;

/// Notification sent on the orchestrator's broadcast channel.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    /// A map cell received a new sample.
    RegionUpdated {
        /// Mode that owns the map (`mapping` or `optimising`)
        mode: Mode,
        /// Cell that was written
        cell: Cell,
        /// Logical position of the cell
        coordinate: Vector2,
        /// Summed rate (kHz)
        value: f64,
    },
    /// The active map ran out of cells.
    MapCompleted {
        /// Mode that owned the map
        mode: Mode,
        /// The finished map
        map: RasterMap,
    },
    /// A correlation histogram was read.
    NewCorrelation(CorrelationHistogram),
    /// The orchestrator changed mode.
    ModeChanged {
        /// Mode left
        from: Mode,
        /// Mode entered
        to: Mode,
    },
    /// Drift correction moved the head or its offset.
    CorrectionApplied(DriftEstimate),
    /// Drift correction found nothing to centre on.
    CorrectionFailed {
        /// Display form of the error
        reason: String,
    },
}

impl ScanEvent {
    /// Short name for logging; matches the serialized `event` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegionUpdated { .. } => "region_updated",
            Self::MapCompleted { .. } => "map_completed",
            Self::NewCorrelation(_) => "new_correlation",
            Self::ModeChanged { .. } => "mode_changed",
            Self::CorrectionApplied(_) => "correction_applied",
            Self::CorrectionFailed { .. } => "correction_failed",
        }
    }
}
