//! Capability traits for the scanning head and the photon counter.
//!
//! The orchestrator only talks to hardware through these two seams. Both are
//! async and return `anyhow::Result`, so drivers can attach whatever context
//! their transport produces; the orchestrator wraps failures in
//! [`DaqError::Hardware`](crate::error::DaqError::Hardware).

use anyhow::Result;
use async_trait::async_trait;

use crate::core::Vector2;
use crate::correlation::CorrelationHistogram;

/// A two-axis positioner carrying the confocal spot.
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Commands an absolute position in micrometres.
    async fn set_position(&self, position: Vector2) -> Result<()>;

    /// Last position reported by the device.
    async fn position(&self) -> Result<Vector2>;
}

/// A multi-channel photon counter with a start-stop correlator.
#[async_trait]
pub trait PhotonCounter: Send + Sync {
    /// Reads the current count rate of every channel in kHz. The scan sample
    /// is the sum over channels.
    async fn read_rates(&self) -> Result<Vec<f64>>;

    /// Starts (or restarts) accumulating a correlation histogram with the
    /// given bin width and half-range, both in nanoseconds.
    async fn start_correlation_capture(&self, resolution_ns: f64, range_ns: f64) -> Result<()>;

    /// Reads the histogram accumulated so far.
    async fn read_correlation(&self) -> Result<CorrelationHistogram>;

    /// Pauses (`true`) or resumes (`false`) histogram accumulation.
    async fn set_correlation_frozen(&self, frozen: bool) -> Result<()>;
}
