//! Core library for the scan_daq application.
//!
//! This library contains the supervisory task engine, the raster-scan
//! orchestrator with its drift correction and correlation gating, the hardware
//! capability traits, and simulated devices. It is used by the `scan_daq`
//! binary and by the integration tests.

pub mod config;
pub mod core;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod scan;
