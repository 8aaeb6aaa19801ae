//! Hardware seams and their simulated implementations.

pub mod capabilities;
pub mod mock;

pub use capabilities::{PhotonCounter, Positioner};
pub use mock::{EmitterModel, SimulatedCounter, SimulatedStage};
