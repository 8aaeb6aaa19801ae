//! Background operation feeding counter readings to the orchestrator.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use super::orchestrator::ScanOrchestrator;
use crate::engine::BackgroundOperation;
use crate::hardware::PhotonCounter;

/// Reads one set of channel rates per activation and hands their sum to
/// [`ScanOrchestrator::on_rate_sample`]. Register it as a periodic operation;
/// the interval sets the dwell time per cell.
pub struct RateSampler {
    counter: Arc<dyn PhotonCounter>,
    orchestrator: Arc<ScanOrchestrator>,
}

impl RateSampler {
    /// Registry name used by the binary.
    pub const NAME: &'static str = "rate_sampler";

    /// Sampler feeding `orchestrator` from `counter`.
    pub fn new(counter: Arc<dyn PhotonCounter>, orchestrator: Arc<ScanOrchestrator>) -> Self {
        Self {
            counter,
            orchestrator,
        }
    }
}

#[async_trait]
impl BackgroundOperation for RateSampler {
    async fn run(&self) -> Result<()> {
        let rates = self.counter.read_rates().await.context("reading count rates")?;
        let sample: f64 = rates.iter().sum();
        self.orchestrator.on_rate_sample(sample).await?;
        Ok(())
    }
}
