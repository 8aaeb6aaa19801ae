//! Scan orchestrator: the mode machine that turns rate samples into raster
//! maps, drift corrections and gated correlation reads.
//!
//! All state lives behind one async mutex. Every command and every sample is
//! handled to completion under that lock, and position commands are issued
//! while it is held, always after the cell write they follow from.
//!
//! Positions are logical: the device receives `position + position_offset`.
//! Drift corrections taken while dwelling on a point accumulate into the
//! offset, so a tracked point keeps its logical coordinate.

use anyhow::Context;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::drift::{estimate_drift, DriftEstimate};
use super::events::ScanEvent;
use super::mode::{Mode, Trigger};
use super::raster::{RasterMap, ScanCursor};
use crate::config::ScanConfig;
use crate::core::{Cell, GridShape, Vector2};
use crate::error::{AppResult, DaqError};
use crate::hardware::{PhotonCounter, Positioner};

/// Map being walked together with its write cursor.
struct ActiveMap {
    map: RasterMap,
    cursor: ScanCursor,
}

struct ScanState {
    mode: Mode,
    previous_mode: Mode,
    raw_position: Vector2,
    position_offset: Vector2,
    active: Option<ActiveMap>,
    last_map: Option<RasterMap>,
    last_optimisation: Option<Instant>,
    last_correlation: Option<Instant>,
    optimisation_interval: Duration,
    auto_optimisation: bool,
    auto_correction: bool,
    hbt_force: bool,
    signal_ratio: f64,
    last_correction: Option<DriftEstimate>,
    samples: u64,
}

impl ScanState {
    fn position(&self) -> Vector2 {
        self.raw_position - self.position_offset
    }

    fn optimisation_due(&self, now: Instant) -> bool {
        self.last_optimisation
            .map_or(true, |t| now.saturating_duration_since(t) >= self.optimisation_interval)
    }

    fn correlation_wanted(&self) -> bool {
        self.hbt_force || self.mode == Mode::Hbt
    }
}

/// Point-in-time view of the orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScanSnapshot {
    /// Current mode
    pub mode: Mode,
    /// Mode before the last transition
    pub previous_mode: Mode,
    /// Logical position (`raw_position - position_offset`)
    pub position: Vector2,
    /// Last position sent to the positioner
    pub raw_position: Vector2,
    /// Accumulated drift correction
    pub position_offset: Vector2,
    /// Shape of the map being walked, if any
    pub active_map: Option<GridShape>,
    /// Raw cursor `(row, col)`, `col == -1` before the first sample
    pub cursor: Option<(usize, isize)>,
    /// Fraction of the peak rate above background
    pub signal_ratio: f64,
    /// Periodic optimisation while dwelling
    pub auto_optimisation: bool,
    /// Signal ratio updates from corrections
    pub auto_correction: bool,
    /// Correlation reads in every mode
    pub hbt_force: bool,
    /// Time between automatic optimisations
    #[serde(with = "humantime_serde")]
    pub optimisation_interval: Duration,
    /// Most recent successful drift correction
    pub last_correction: Option<DriftEstimate>,
    /// Rate samples handled so far
    pub samples: u64,
}

/// Drives raster scans, drift correction and HBT gating.
pub struct ScanOrchestrator {
    state: Mutex<ScanState>,
    positioner: Arc<dyn Positioner>,
    counter: Arc<dyn PhotonCounter>,
    events: broadcast::Sender<ScanEvent>,
    config: ScanConfig,
}

impl ScanOrchestrator {
    /// Creates an idle orchestrator. The logical position starts at the
    /// origin; call [`sync_position`](Self::sync_position) to adopt the
    /// device's current position instead.
    pub fn new(
        positioner: Arc<dyn Positioner>,
        counter: Arc<dyn PhotonCounter>,
        config: ScanConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let state = ScanState {
            mode: Mode::Idle,
            previous_mode: Mode::Idle,
            raw_position: Vector2::ZERO,
            position_offset: Vector2::ZERO,
            active: None,
            last_map: None,
            last_optimisation: None,
            last_correlation: None,
            optimisation_interval: config.optimisation_interval,
            auto_optimisation: config.auto_optimisation,
            auto_correction: config.auto_correction,
            hbt_force: false,
            signal_ratio: 1.0,
            last_correction: None,
            samples: 0,
        };
        Self {
            state: Mutex::new(state),
            positioner,
            counter,
            events,
            config,
        }
    }

    /// Receiver for every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Starts walking `map` from its first cell. Resets the position offset.
    ///
    /// # Errors
    /// [`DaqError::InvalidTransition`] unless idle. A positioning failure
    /// leaves the orchestrator idle.
    pub async fn scan(&self, map: RasterMap) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let next = Self::next_mode(&state, Trigger::Scan)?;
        info!(shape = %map.shape(), centre = %map.centre(), step = %map.step(), "Starting raster scan");

        state.position_offset = Vector2::ZERO;
        let result = self.begin_map(&mut state, map).await;
        if result.is_ok() {
            self.set_mode(&mut state, next).await;
        }
        self.idle_on_error(&mut state, "scan", result).await
    }

    /// Moves to `point` and dwells there, optimising first if
    /// auto-optimisation is on. The move happens from idle, so a following
    /// drift correction re-targets the head instead of the offset.
    ///
    /// # Errors
    /// [`DaqError::InvalidTransition`] while a map is being walked.
    pub async fn choose_point(&self, point: Vector2) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let trigger = if state.auto_optimisation {
            Trigger::ChoosePointOptimised
        } else {
            Trigger::ChoosePoint
        };
        let next = Self::next_mode(&state, trigger)?;
        info!(point = %point, next = %next, "Point chosen");

        let mut result = self.enter(&mut state, Trigger::Stop).await;
        if result.is_ok() {
            result = self.settle_on(&mut state, point, next).await;
        }
        self.idle_on_error(&mut state, "choose_point", result).await
    }

    /// Runs a corrective map around the current point now.
    ///
    /// # Errors
    /// [`DaqError::InvalidTransition`] unless on target or in HBT.
    pub async fn optimise(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        Self::next_mode(&state, Trigger::Optimise)?;
        let result = self.enter(&mut state, Trigger::Optimise).await;
        self.idle_on_error(&mut state, "optimise", result).await
    }

    /// Configures the correlator and switches to HBT mode.
    ///
    /// # Errors
    /// [`DaqError::InvalidTransition`] unless on target or already in HBT;
    /// [`DaqError::Hardware`] if the counter rejects the capture, in which
    /// case the mode is unchanged.
    pub async fn setup_hbt(&self, resolution_ns: f64, range_ns: f64) -> AppResult<()> {
        let mut state = self.state.lock().await;
        Self::next_mode(&state, Trigger::SetupHbt)?;
        self.counter
            .start_correlation_capture(resolution_ns, range_ns)
            .await
            .context("starting correlation capture")?;
        info!(resolution_ns, range_ns, "Correlation capture started");
        state.last_correlation = None;
        self.enter(&mut state, Trigger::SetupHbt).await
    }

    /// Leaves HBT mode and keeps dwelling on the point.
    ///
    /// # Errors
    /// [`DaqError::InvalidTransition`] unless in HBT.
    pub async fn stop_hbt(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        self.enter(&mut state, Trigger::StopHbt).await
    }

    /// Returns to idle immediately, abandoning any unvisited cells.
    ///
    /// # Errors
    /// Never fails in practice: every mode accepts the stop trigger.
    pub async fn stop(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if let Some(active) = &state.active {
            info!(shape = %active.map.shape(), cursor = ?active.cursor.position(), "Abandoning active map");
        }
        self.enter(&mut state, Trigger::Stop).await
    }

    /// Adopts the positioner's reported position as the raw position.
    pub async fn sync_position(&self) -> AppResult<Vector2> {
        let mut state = self.state.lock().await;
        let raw = self.positioner.position().await.context("reading stage position")?;
        state.raw_position = raw;
        Ok(state.position())
    }

    // =========================================================================
    // Sample handling
    // =========================================================================

    /// Consumes one rate sample (kHz, summed over channels).
    ///
    /// # Errors
    /// Any failure while handling the sample returns the orchestrator to
    /// idle before the error is returned. Correlation read failures are only
    /// logged.
    pub async fn on_rate_sample(&self, rate: f64) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.samples += 1;

        let result = self.process_sample(&mut state, rate, now).await;
        if result.is_err() {
            return self.idle_on_error(&mut state, "on_rate_sample", result).await;
        }
        self.gate_correlation(&mut state, now).await;
        Ok(())
    }

    async fn process_sample(&self, state: &mut ScanState, rate: f64, now: Instant) -> AppResult<()> {
        let mode = state.mode;
        if mode.holds_map() {
            self.record_sample(state, rate, now).await
        } else if mode.is_dwelling() && state.auto_optimisation && state.optimisation_due(now) {
            debug!(mode = %mode, "Optimisation interval elapsed");
            self.enter(state, Trigger::Optimise).await
        } else {
            Ok(())
        }
    }

    async fn record_sample(&self, state: &mut ScanState, rate: f64, now: Instant) -> AppResult<()> {
        if !rate.is_finite() {
            return Err(DaqError::InvalidMap(format!("non-finite rate sample {rate}")));
        }
        let mode = state.mode;
        let active = state
            .active
            .as_mut()
            .ok_or_else(|| DaqError::InvalidMap(format!("no active map in mode {mode}")))?;

        // The head was moved onto the first cell when the map started.
        if active.cursor.is_unstarted() {
            active.cursor.advance();
        }
        let cell = active
            .cursor
            .cell()
            .ok_or_else(|| DaqError::InvalidMap("cursor left the map".into()))?;
        active.map.set(cell, rate)?;
        let coordinate = active.map.coordinate(cell);
        let next = active.cursor.advance().map(|c| active.map.coordinate(c));

        self.publish(ScanEvent::RegionUpdated {
            mode,
            cell,
            coordinate,
            value: rate,
        });

        match next {
            Some(target) => self.move_to(state, target).await,
            None => match state.active.take() {
                Some(done) => self.finish_map(state, done.map, now).await,
                None => Ok(()),
            },
        }
    }

    async fn finish_map(&self, state: &mut ScanState, map: RasterMap, now: Instant) -> AppResult<()> {
        let mode = state.mode;
        info!(
            mode = %mode,
            shape = %map.shape(),
            min = map.min(),
            max = map.max(),
            "Map complete"
        );
        state.last_map = Some(map.clone());
        self.publish(ScanEvent::MapCompleted {
            mode,
            map: map.clone(),
        });
        if mode == Mode::Optimising {
            self.apply_correction(state, &map, now).await?;
        }
        self.enter(state, Trigger::MapComplete).await
    }

    async fn apply_correction(&self, state: &mut ScanState, map: &RasterMap, now: Instant) -> AppResult<()> {
        state.last_optimisation = Some(now);
        match estimate_drift(map, self.config.background_percentile) {
            Ok(estimate) => {
                if state.previous_mode == Mode::Idle {
                    self.move_to(state, estimate.centre + estimate.drift).await?;
                } else {
                    state.position_offset += estimate.drift;
                    self.move_to(state, estimate.centre).await?;
                }
                if state.auto_correction {
                    state.signal_ratio = estimate.signal_ratio();
                }
                info!(
                    drift = %estimate.drift,
                    background = estimate.background,
                    max = estimate.max,
                    offset = %state.position_offset,
                    "Drift correction applied"
                );
                state.last_correction = Some(estimate);
                self.publish(ScanEvent::CorrectionApplied(estimate));
                Ok(())
            }
            Err(err @ DaqError::NoSignal { .. }) => {
                warn!(error = %err, centre = %map.centre(), "Drift correction skipped");
                self.publish(ScanEvent::CorrectionFailed {
                    reason: err.to_string(),
                });
                self.move_to(state, map.centre()).await
            }
            Err(err) => Err(err),
        }
    }

    async fn gate_correlation(&self, state: &mut ScanState, now: Instant) {
        if !state.correlation_wanted() {
            return;
        }
        if let Some(last) = state.last_correlation {
            if now.saturating_duration_since(last) < self.config.correlation_interval {
                return;
            }
        }
        match self.counter.read_correlation().await {
            Ok(histogram) => {
                state.last_correlation = Some(now);
                debug!(bins = histogram.len(), total = histogram.total(), "Correlation read");
                self.publish(ScanEvent::NewCorrelation(histogram));
            }
            Err(err) => warn!(error = %format!("{err:#}"), "Correlation read failed"),
        }
    }

    // =========================================================================
    // Mode machine
    // =========================================================================

    fn next_mode(state: &ScanState, trigger: Trigger) -> AppResult<Mode> {
        state
            .mode
            .next(trigger, state.previous_mode)
            .ok_or(DaqError::InvalidTransition {
                command: trigger.command(),
                mode: state.mode,
            })
    }

    async fn enter(&self, state: &mut ScanState, trigger: Trigger) -> AppResult<()> {
        let next = Self::next_mode(state, trigger)?;
        self.set_mode(state, next).await;
        if next == Mode::Optimising {
            self.start_corrective_map(state).await?;
        }
        Ok(())
    }

    async fn set_mode(&self, state: &mut ScanState, next: Mode) {
        if !next.holds_map() {
            state.active = None;
        }
        let from = state.mode;
        if from == next {
            return;
        }
        state.previous_mode = from;
        state.mode = next;
        info!(from = %from, to = %next, "Scan mode changed");
        self.publish(ScanEvent::ModeChanged { from, to: next });
        self.apply_freeze(state).await;
    }

    async fn settle_on(&self, state: &mut ScanState, point: Vector2, next: Mode) -> AppResult<()> {
        self.move_to(state, point).await?;
        self.set_mode(state, next).await;
        if next == Mode::Optimising {
            self.start_corrective_map(state).await?;
        }
        Ok(())
    }

    async fn idle_on_error(
        &self,
        state: &mut ScanState,
        command: &'static str,
        result: AppResult<()>,
    ) -> AppResult<()> {
        if let Err(err) = &result {
            error!(command, mode = %state.mode, error = %err, "Scan processing failed; forcing idle");
            self.set_mode(state, Mode::Idle).await;
        }
        result
    }

    async fn start_corrective_map(&self, state: &mut ScanState) -> AppResult<()> {
        let map = RasterMap::square(
            self.config.optimisation_size,
            self.config.optimisation_step,
            state.position(),
        )?;
        debug!(centre = %map.centre(), shape = %map.shape(), "Corrective map started");
        self.begin_map(state, map).await
    }

    async fn begin_map(&self, state: &mut ScanState, map: RasterMap) -> AppResult<()> {
        let first = map.coordinate(Cell::new(0, 0));
        state.active = Some(ActiveMap {
            cursor: ScanCursor::new(map.shape()),
            map,
        });
        self.move_to(state, first).await
    }

    async fn move_to(&self, state: &mut ScanState, target: Vector2) -> AppResult<()> {
        let raw = target + state.position_offset;
        self.positioner
            .set_position(raw)
            .await
            .with_context(|| format!("moving to {target}"))?;
        state.raw_position = raw;
        Ok(())
    }

    async fn apply_freeze(&self, state: &ScanState) {
        let frozen = !state.hbt_force && state.mode != Mode::Hbt;
        if let Err(err) = self.counter.set_correlation_frozen(frozen).await {
            warn!(frozen, error = %format!("{err:#}"), "Could not update correlation freeze");
        }
    }

    fn publish(&self, event: ScanEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Settings and inspection
    // =========================================================================

    /// Enables the periodic corrective map while dwelling.
    pub async fn set_auto_optimisation(&self, enabled: bool) {
        self.state.lock().await.auto_optimisation = enabled;
    }

    /// Enables updating the signal ratio from corrections.
    pub async fn set_auto_correction(&self, enabled: bool) {
        self.state.lock().await.auto_correction = enabled;
    }

    /// Sets the time between automatic optimisations.
    pub async fn set_optimisation_interval(&self, interval: Duration) {
        self.state.lock().await.optimisation_interval = interval;
    }

    /// Forces correlation reads in every mode, not just HBT.
    pub async fn set_hbt_force(&self, force: bool) {
        let mut state = self.state.lock().await;
        if state.hbt_force != force {
            state.hbt_force = force;
            self.apply_freeze(&state).await;
        }
    }

    /// Current mode.
    pub async fn mode(&self) -> Mode {
        self.state.lock().await.mode
    }

    /// Logical position, `raw_position - position_offset`.
    pub async fn position(&self) -> Vector2 {
        self.state.lock().await.position()
    }

    /// Accumulated drift correction.
    pub async fn position_offset(&self) -> Vector2 {
        self.state.lock().await.position_offset
    }

    /// Signal ratio used for g2 background correction.
    pub async fn signal_ratio(&self) -> f64 {
        self.state.lock().await.signal_ratio
    }

    /// Most recently completed map, raster or corrective.
    pub async fn last_map(&self) -> Option<RasterMap> {
        self.state.lock().await.last_map.clone()
    }

    /// Copies the current state.
    pub async fn snapshot(&self) -> ScanSnapshot {
        let state = self.state.lock().await;
        ScanSnapshot {
            mode: state.mode,
            previous_mode: state.previous_mode,
            position: state.position(),
            raw_position: state.raw_position,
            position_offset: state.position_offset,
            active_map: state.active.as_ref().map(|a| a.map.shape()),
            cursor: state.active.as_ref().map(|a| a.cursor.position()),
            signal_ratio: state.signal_ratio,
            auto_optimisation: state.auto_optimisation,
            auto_correction: state.auto_correction,
            hbt_force: state.hbt_force,
            optimisation_interval: state.optimisation_interval,
            last_correction: state.last_correction,
            samples: state.samples,
        }
    }
}
