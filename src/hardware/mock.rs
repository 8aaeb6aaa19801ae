//! Simulated Hardware Implementations
//!
//! Provides an in-process scanning stage and photon counter so the scan
//! orchestrator can run end-to-end without a microscope attached.
//! All waits use `tokio::time`, so tests may pause the clock.
//!
//! # Available Simulations
//!
//! - `SimulatedStage` - Two-axis positioner that stores the commanded position
//! - `SimulatedCounter` - Two-channel counter imaging a single gaussian emitter
//!   on a flat background, with a correlator showing an antibunching dip
//!
//! The emitter may drift at a constant velocity, which is what the drift
//! correction in the orchestrator is meant to follow.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::core::Vector2;
use crate::correlation::CorrelationHistogram;
use crate::hardware::capabilities::{PhotonCounter, Positioner};

// =============================================================================
// SimulatedStage - Two-axis positioner
// =============================================================================

/// Simulated galvo/piezo stage.
///
/// Moves are instantaneous unless a settle time is configured.
///
/// # Example
///
/// ```rust,ignore
/// let stage = SimulatedStage::new();
/// stage.set_position(Vector2::new(1.0, -2.0)).await?;
/// assert_eq!(stage.position().await?, Vector2::new(1.0, -2.0));
/// ```
pub struct SimulatedStage {
    position: RwLock<Vector2>,
    settle: Duration,
    moves: AtomicU32,
}

impl SimulatedStage {
    /// Create new stage at the origin
    pub fn new() -> Self {
        Self::with_settle(Duration::ZERO)
    }

    /// Create stage that waits `settle` after every move
    pub fn with_settle(settle: Duration) -> Self {
        Self {
            position: RwLock::new(Vector2::ZERO),
            settle,
            moves: AtomicU32::new(0),
        }
    }

    /// Number of `set_position` calls received
    pub fn move_count(&self) -> u32 {
        self.moves.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Positioner for SimulatedStage {
    async fn set_position(&self, position: Vector2) -> Result<()> {
        if !position.is_finite() {
            bail!("SimulatedStage: refusing non-finite target {position}");
        }
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        *self.position.write().await = position;
        self.moves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn position(&self) -> Result<Vector2> {
        Ok(*self.position.read().await)
    }
}

// =============================================================================
// SimulatedCounter - Photon counter imaging one emitter
// =============================================================================

/// Optical model seen by [`SimulatedCounter`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterModel {
    /// Emitter location at t = 0 (µm)
    pub emitter: Vector2,
    /// Emitter velocity (µm/s)
    pub drift: Vector2,
    /// Point-spread-function standard deviation (µm)
    pub psf_sigma: f64,
    /// Emitter rate on top of background when perfectly on target (kHz)
    pub peak_rate: f64,
    /// Uncorrelated background rate (kHz)
    pub background_rate: f64,
    /// Uniform relative noise amplitude applied to each reading
    pub noise: f64,
    /// Seed for the noise generator
    pub seed: u64,
    /// Antibunching time constant (ns)
    pub lifetime_ns: f64,
}

impl Default for EmitterModel {
    fn default() -> Self {
        Self {
            emitter: Vector2::ZERO,
            drift: Vector2::ZERO,
            psf_sigma: 0.15,
            peak_rate: 100.0,
            background_rate: 10.0,
            noise: 0.02,
            seed: 7,
            lifetime_ns: 12.0,
        }
    }
}

impl EmitterModel {
    /// Noise-free total rate with the spot at `spot` and the emitter at `emitter`.
    pub fn rate_at(&self, spot: Vector2, emitter: Vector2) -> f64 {
        let r2 = (spot - emitter).norm().powi(2);
        let sigma2 = self.psf_sigma.max(f64::EPSILON).powi(2);
        self.background_rate + self.peak_rate * (-r2 / (2.0 * sigma2)).exp()
    }
}

#[derive(Clone, Copy, Debug)]
struct CaptureSettings {
    resolution_ns: f64,
    range_ns: f64,
}

struct CorrelatorState {
    capture: Option<CaptureSettings>,
    frozen: bool,
    accumulated: Duration,
    last_update: Instant,
    signal_ratio: f64,
    freeze_calls: Vec<bool>,
    captures: u32,
}

/// Simulated two-channel counter with a correlator.
///
/// Rates follow [`EmitterModel::rate_at`] for the stage's current position,
/// split evenly over two channels. The correlator accumulates a
/// `1 - ρ²·exp(-|τ|/lifetime)` histogram while not frozen, where ρ is the
/// signal fraction at the spot.
pub struct SimulatedCounter {
    stage: Arc<SimulatedStage>,
    model: EmitterModel,
    epoch: Instant,
    rng: Mutex<StdRng>,
    correlator: Mutex<CorrelatorState>,
    failures_pending: AtomicU32,
    reads: AtomicU32,
}

impl SimulatedCounter {
    /// Create a counter looking through `stage` at the emitter described by `model`.
    pub fn new(stage: Arc<SimulatedStage>, model: EmitterModel) -> Self {
        let now = Instant::now();
        Self {
            stage,
            rng: Mutex::new(StdRng::seed_from_u64(model.seed)),
            model,
            epoch: now,
            correlator: Mutex::new(CorrelatorState {
                capture: None,
                frozen: true,
                accumulated: Duration::ZERO,
                last_update: now,
                signal_ratio: 0.0,
                freeze_calls: Vec::new(),
                captures: 0,
            }),
            failures_pending: AtomicU32::new(0),
            reads: AtomicU32::new(0),
        }
    }

    /// Current emitter location, including drift.
    pub fn emitter_position(&self) -> Vector2 {
        self.model.emitter + self.model.drift * self.epoch.elapsed().as_secs_f64()
    }

    /// Makes the next `n` calls to `read_rates` fail.
    pub fn fail_next_reads(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Successful `read_rates` calls so far.
    pub fn read_count(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Arguments of every `set_correlation_frozen` call, in order.
    pub fn freeze_history(&self) -> Vec<bool> {
        self.correlator.lock().freeze_calls.clone()
    }

    /// True if accumulation is currently paused.
    pub fn is_frozen(&self) -> bool {
        self.correlator.lock().frozen
    }

    /// Number of `start_correlation_capture` calls.
    pub fn capture_count(&self) -> u32 {
        self.correlator.lock().captures
    }

    fn accumulate(state: &mut CorrelatorState) {
        let now = Instant::now();
        if !state.frozen {
            state.accumulated += now.saturating_duration_since(state.last_update);
        }
        state.last_update = now;
    }
}

#[async_trait]
impl PhotonCounter for SimulatedCounter {
    async fn read_rates(&self) -> Result<Vec<f64>> {
        let pending = self.failures_pending.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures_pending.store(pending - 1, Ordering::SeqCst);
            bail!("SimulatedCounter: readout timed out");
        }

        let spot = self.stage.position().await?;
        let emitter = self.emitter_position();
        let clean = self.model.rate_at(spot, emitter);
        let jitter = if self.model.noise > 0.0 {
            self.rng.lock().gen_range(-self.model.noise..=self.model.noise)
        } else {
            0.0
        };
        let total = (clean * (1.0 + jitter)).max(0.0);

        {
            let mut state = self.correlator.lock();
            Self::accumulate(&mut state);
            state.signal_ratio = ((clean - self.model.background_rate) / clean).clamp(0.0, 1.0);
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(vec![total / 2.0, total / 2.0])
    }

    async fn start_correlation_capture(&self, resolution_ns: f64, range_ns: f64) -> Result<()> {
        if !(resolution_ns > 0.0 && range_ns >= resolution_ns) {
            bail!(
                "SimulatedCounter: invalid correlation window (resolution {resolution_ns} ns, range {range_ns} ns)"
            );
        }
        let mut state = self.correlator.lock();
        state.capture = Some(CaptureSettings {
            resolution_ns,
            range_ns,
        });
        state.accumulated = Duration::ZERO;
        state.last_update = Instant::now();
        state.captures += 1;
        debug!(resolution_ns, range_ns, "Simulated correlation capture started");
        Ok(())
    }

    async fn read_correlation(&self) -> Result<CorrelationHistogram> {
        let mut state = self.correlator.lock();
        let Some(settings) = state.capture else {
            bail!("SimulatedCounter: correlation capture not started");
        };
        Self::accumulate(&mut state);

        let bins = (2.0 * settings.range_ns / settings.resolution_ns).round().max(1.0) as usize;
        let rho_sq = state.signal_ratio.powi(2);
        let lifetime = self.model.lifetime_ns.max(f64::EPSILON);
        let pairs_per_bin = state.accumulated.as_secs_f64() * 1000.0;

        let centres: Vec<f64> = (0..bins)
            .map(|i| -settings.range_ns + (i as f64 + 0.5) * settings.resolution_ns)
            .collect();
        let counts = centres
            .iter()
            .map(|tau| pairs_per_bin * (1.0 - rho_sq * (-tau.abs() / lifetime).exp()))
            .collect();

        Ok(CorrelationHistogram::new(centres, counts, state.accumulated))
    }

    async fn set_correlation_frozen(&self, frozen: bool) -> Result<()> {
        let mut state = self.correlator.lock();
        Self::accumulate(&mut state);
        state.frozen = frozen;
        state.freeze_calls.push(frozen);
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
