//! End-to-end scan workflows: the rate sampler running inside the task
//! engine, driving the orchestrator against simulated hardware.

use anyhow::Result;
use async_trait::async_trait;
use scan_daq::config::ScanConfig;
use scan_daq::core::{GridShape, Vector2};
use scan_daq::engine::{EngineConfig, EngineOwner, LoggingOwner, Schedule, TaskEngine};
use scan_daq::error::DaqError;
use scan_daq::hardware::{EmitterModel, Positioner, SimulatedCounter, SimulatedStage};
use scan_daq::scan::{Mode, RasterMap, RateSampler, ScanEvent, ScanOrchestrator};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

struct Rig {
    stage: Arc<dyn Positioner>,
    counter: Arc<SimulatedCounter>,
    orchestrator: Arc<ScanOrchestrator>,
    engine: TaskEngine,
    supervisor: tokio::task::JoinHandle<()>,
}

impl Rig {
    fn start(stage: Arc<SimulatedStage>, positioner: Arc<dyn Positioner>, model: EmitterModel, scan: ScanConfig) -> Self {
        Self::start_with_owner(stage, positioner, model, scan, Arc::new(LoggingOwner))
    }

    fn start_with_owner(
        stage: Arc<SimulatedStage>,
        positioner: Arc<dyn Positioner>,
        model: EmitterModel,
        scan: ScanConfig,
        owner: Arc<dyn EngineOwner>,
    ) -> Self {
        let counter = Arc::new(SimulatedCounter::new(stage, model));
        let orchestrator = Arc::new(ScanOrchestrator::new(positioner.clone(), counter.clone(), scan));
        let engine = TaskEngine::new(owner, EngineConfig::default()).unwrap();
        engine
            .register(
                RateSampler::NAME,
                RateSampler::new(counter.clone(), orchestrator.clone()),
                Schedule::Periodic(SAMPLE_INTERVAL),
            )
            .unwrap();
        let supervisor = engine.start();
        Self {
            stage: positioner,
            counter,
            orchestrator,
            engine,
            supervisor,
        }
    }

    fn simulated(model: EmitterModel, scan: ScanConfig) -> Self {
        let stage = Arc::new(SimulatedStage::new());
        Self::start(stage.clone(), stage, model, scan)
    }

    async fn shutdown(self) {
        self.engine.shutdown();
        self.supervisor.await.unwrap();
    }
}

fn quiet_model() -> EmitterModel {
    EmitterModel {
        noise: 0.0,
        ..EmitterModel::default()
    }
}

/// Collects events until `stop` returns true for one of them.
async fn collect_until(
    rx: &mut broadcast::Receiver<ScanEvent>,
    mut stop: impl FnMut(&ScanEvent) -> bool,
) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let done = stop(&event);
                    events.push(event);
                    if done {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => panic!("test receiver lagged by {n}"),
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive in time");
    events
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scan_ends_idle_after_one_sample_per_cell() {
    let rig = Rig::simulated(quiet_model(), ScanConfig::default());
    let mut rx = rig.orchestrator.subscribe();

    let shape = GridShape::new(5, 7);
    let map = RasterMap::new(shape, Vector2::new(0.1, 0.1), Vector2::ZERO).unwrap();
    rig.orchestrator.scan(map).await.unwrap();

    let events = collect_until(&mut rx, |e| {
        matches!(e, ScanEvent::ModeChanged { to: Mode::Idle, .. })
    })
    .await;

    let updates = events
        .iter()
        .filter(|e| matches!(e, ScanEvent::RegionUpdated { mode: Mode::Mapping, .. }))
        .count();
    assert_eq!(updates, shape.len());
    assert_eq!(rig.orchestrator.mode().await, Mode::Idle);
    assert_eq!(rig.orchestrator.position_offset().await, Vector2::ZERO);

    let map = rig.orchestrator.last_map().await.unwrap();
    assert!(map.data().iter().all(|&v| v >= 10.0 - 1e-9));
    // The emitter sits at the centre cell.
    let peak = map.samples().max_by(|a, b| a.2.total_cmp(&b.2)).unwrap();
    assert!(peak.1.distance(Vector2::ZERO) < 1e-9, "peak at {}", peak.1);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_choose_point_recentres_on_offset_emitter() {
    let model = EmitterModel {
        emitter: Vector2::new(1.2, -0.7),
        ..quiet_model()
    };
    let rig = Rig::simulated(model, ScanConfig::default());
    let mut rx = rig.orchestrator.subscribe();

    rig.orchestrator.choose_point(Vector2::new(1.1, -0.65)).await.unwrap();
    let events = collect_until(&mut rx, |e| {
        matches!(e, ScanEvent::ModeChanged { to: Mode::OnTarget, .. })
    })
    .await;

    let correction = events
        .iter()
        .find_map(|e| match e {
            ScanEvent::CorrectionApplied(estimate) => Some(*estimate),
            _ => None,
        })
        .expect("a correction was applied");
    assert!(correction.drift.x > 0.05 && correction.drift.y < 0.0, "drift {}", correction.drift);

    let position = rig.orchestrator.position().await;
    assert!(
        position.distance(Vector2::new(1.2, -0.7)) < 0.06,
        "ended at {position}"
    );
    // Chosen from idle: the head moves, the offset does not.
    assert_eq!(rig.orchestrator.position_offset().await, Vector2::ZERO);
    assert!(rig.orchestrator.signal_ratio().await > 0.5);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tracking_follows_drift_through_offset() {
    let model = EmitterModel {
        drift: Vector2::new(0.2, 0.0),
        ..quiet_model()
    };
    let scan = ScanConfig {
        optimisation_interval: Duration::from_millis(20),
        ..ScanConfig::default()
    };
    let rig = Rig::simulated(model, scan);
    let mut rx = rig.orchestrator.subscribe();

    rig.orchestrator.choose_point(Vector2::ZERO).await.unwrap();
    let mut corrections = 0;
    collect_until(&mut rx, |e| {
        if let ScanEvent::CorrectionApplied(_) = e {
            corrections += 1;
        }
        corrections >= 4
    })
    .await;
    collect_until(&mut rx, |e| {
        matches!(e, ScanEvent::ModeChanged { to: Mode::OnTarget, .. })
    })
    .await;

    let snapshot = rig.orchestrator.snapshot().await;
    assert_eq!(snapshot.mode, Mode::OnTarget);
    assert!(snapshot.position_offset.x > 0.0, "offset {}", snapshot.position_offset);

    let emitter = rig.counter.emitter_position();
    let raw = rig.stage.position().await.unwrap();
    assert!(
        (raw.x - emitter.x).abs() < 0.15,
        "stage at {raw}, emitter at {emitter}"
    );

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hbt_mode_gates_correlation_reads() {
    let rig = Rig::simulated(
        quiet_model(),
        ScanConfig {
            auto_optimisation: false,
            correlation_interval: Duration::from_millis(20),
            ..ScanConfig::default()
        },
    );
    let mut rx = rig.orchestrator.subscribe();

    rig.orchestrator.choose_point(Vector2::ZERO).await.unwrap();
    assert_eq!(rig.orchestrator.mode().await, Mode::OnTarget);
    assert!(rig.counter.is_frozen());

    rig.orchestrator.setup_hbt(1.0, 50.0).await.unwrap();
    assert!(!rig.counter.is_frozen());
    assert_eq!(rig.counter.capture_count(), 1);

    let mut histograms = 0;
    let events = collect_until(&mut rx, |e| {
        if matches!(e, ScanEvent::NewCorrelation(_)) {
            histograms += 1;
        }
        histograms >= 2
    })
    .await;
    let last = events
        .iter()
        .rev()
        .find_map(|e| match e {
            ScanEvent::NewCorrelation(h) => Some(h.clone()),
            _ => None,
        })
        .unwrap();
    let (_, dip) = last.dip(true, false, 1.0).unwrap();
    assert!(dip < 0.5, "antibunching dip {dip}");

    rig.orchestrator.stop_hbt().await.unwrap();
    assert_eq!(rig.orchestrator.mode().await, Mode::OnTarget);
    assert!(rig.counter.is_frozen());
    assert_eq!(
        rig.counter.freeze_history().last(),
        Some(&true),
        "leaving HBT freezes the correlator"
    );

    rig.shutdown().await;
}

/// Positioner that starts failing after a number of moves.
struct WornStage {
    inner: Arc<SimulatedStage>,
    moves_left: AtomicU32,
}

#[async_trait]
impl Positioner for WornStage {
    async fn set_position(&self, position: Vector2) -> Result<()> {
        if self.moves_left.load(Ordering::SeqCst) == 0 {
            anyhow::bail!("piezo controller not responding");
        }
        self.moves_left.fetch_sub(1, Ordering::SeqCst);
        self.inner.set_position(position).await
    }

    async fn position(&self) -> Result<Vector2> {
        self.inner.position().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_positioning_failure_mid_scan_forces_idle() {
    let stage = Arc::new(SimulatedStage::new());
    let worn = Arc::new(WornStage {
        inner: stage.clone(),
        moves_left: AtomicU32::new(4),
    });
    let rig = Rig::start(stage, worn, quiet_model(), ScanConfig::default());
    let mut rx = rig.orchestrator.subscribe();

    let map = RasterMap::square(4, 0.1, Vector2::ZERO).unwrap();
    rig.orchestrator.scan(map).await.unwrap();
    let events = collect_until(&mut rx, |e| {
        matches!(e, ScanEvent::ModeChanged { to: Mode::Idle, .. })
    })
    .await;

    let updates = events
        .iter()
        .filter(|e| matches!(e, ScanEvent::RegionUpdated { .. }))
        .count();
    assert_eq!(updates, 4);
    assert!(!events.iter().any(|e| matches!(e, ScanEvent::MapCompleted { .. })));
    assert_eq!(rig.orchestrator.snapshot().await.active_map, None);
    assert!(rig.orchestrator.last_map().await.is_none());

    // The sampler keeps running: samples in idle are harmless.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(rig.orchestrator.mode().await, Mode::Idle);

    rig.shutdown().await;
}

#[derive(Default)]
struct FailureLog {
    failures: parking_lot::Mutex<Vec<String>>,
}

impl EngineOwner for FailureLog {
    fn handle_error(&self, name: &str, error: &DaqError) {
        self.failures.lock().push(format!("{name}: {error}"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_counter_outage_parks_sampler_and_reports_once() {
    let stage = Arc::new(SimulatedStage::new());
    let owner = Arc::new(FailureLog::default());
    let rig = Rig::start_with_owner(
        stage.clone(),
        stage,
        quiet_model(),
        ScanConfig::default(),
        owner.clone(),
    );
    rig.counter.fail_next_reads(u32::MAX);
    // Let any read already in flight land while still idle.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let map = RasterMap::square(3, 0.1, Vector2::ZERO).unwrap();
    rig.orchestrator.scan(map).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let failures = owner.failures.lock().clone();
    assert_eq!(failures.len(), 1, "{failures:?}");
    assert!(failures[0].contains(RateSampler::NAME));
    assert!(failures[0].contains("reading count rates"));

    // The orchestrator is untouched by sampler failures; it waits for data.
    assert_eq!(rig.orchestrator.mode().await, Mode::Mapping);
    assert_eq!(rig.orchestrator.snapshot().await.cursor, Some((0, -1)));

    rig.shutdown().await;
}
