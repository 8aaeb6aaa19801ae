//! Raster scanning, drift correction and correlation gating.
//!
//! - [`raster`]: maps and the boustrophedon cursor
//! - [`drift`]: centroid-based drift estimation
//! - [`mode`]: orchestrator modes and transitions
//! - [`orchestrator`]: the mode machine driving the hardware
//! - [`sampler`]: the background operation that feeds it samples

pub mod drift;
pub mod events;
pub mod mode;
pub mod orchestrator;
pub mod raster;
pub mod sampler;

pub use drift::{estimate_drift, DriftEstimate};
pub use events::ScanEvent;
pub use mode::{Mode, Trigger};
pub use orchestrator::{ScanOrchestrator, ScanSnapshot};
pub use raster::{boustrophedon, RasterMap, ScanCursor};
pub use sampler::RateSampler;
