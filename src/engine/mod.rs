//! Supervisory task engine.
//!
//! The [`TaskEngine`] owns a named registry of [`BackgroundOperation`]s and runs
//! each one on its own Tokio task. A single coordinator task executes the pass
//! loop:
//!
//! ```text
//! register() ──spawn──> activation task ──outcome──┐
//!      │                                           │
//!      └──────wake──────> pass loop <──wake────────┘
//!                            │
//!            retry / restart / drain / park
//!                            │
//!                  EngineOwner::{handle_error, on_pass}
//! ```
//!
//! Each pass inspects every registered operation:
//!
//! 1. A failed activation is retried while the [`RecoveryPolicy`] allows it. Once
//!    the budget is spent the owner's `handle_error` is called exactly once for
//!    that failure streak, and the operation is either parked or retried every
//!    pass depending on the policy.
//! 2. A running or sleeping activation is left alone.
//! 3. A clean exit restarts periodic operations after their interval and drains
//!    one-shot operations from the registry.
//!
//! Between passes the loop sleeps for at most `max_wait`, or until a
//! registration or a finishing activation wakes it.

mod operation;

pub use operation::{
    from_fn, BackgroundOperation, FnOperation, OperationInfo, OperationStatus, Schedule,
};

use crate::error::{AppResult, DaqError};
use crate::error_recovery::RecoveryPolicy;
use operation::{OperationEntry, Outcome, Signals};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receives notifications from the task engine.
///
/// Both methods are called from the coordinator task with no engine lock
/// held, so implementations may register or unregister operations.
pub trait EngineOwner: Send + Sync {
    /// Called once per failure streak when an operation could not be recovered.
    fn handle_error(&self, name: &str, error: &DaqError) {
        error!(operation = name, error = %error, "Background operation failed persistently");
    }

    /// Called after every pass.
    fn on_pass(&self, _report: &PassReport) {}
}

/// Owner that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingOwner;

impl EngineOwner for LoggingOwner {}

/// Summary of one pass, handed to [`EngineOwner::on_pass`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    /// 1-based pass number
    pub pass: u64,
    /// Activations still running or sleeping
    pub running: usize,
    /// Periodic operations relaunched after a clean exit
    pub restarted: usize,
    /// Failed operations relaunched
    pub retried: usize,
    /// Operations parked after exhausting their retries
    pub failed: usize,
    /// One-shot operations removed after a clean exit
    pub drained: usize,
}

/// Engine tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on the idle wait between passes.
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
    /// Retry and reporting policy for failed operations.
    pub recovery: RecoveryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(10),
            recovery: RecoveryPolicy::default(),
        }
    }
}

struct EngineInner {
    registry: Mutex<HashMap<String, OperationEntry>>,
    signals: Signals,
    passes: AtomicU64,
    owner: Arc<dyn EngineOwner>,
    config: EngineConfig,
    runtime: Handle,
}

/// Supervises named background operations. Cheap to clone; clones share the
/// same registry.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("operations", &self.names())
            .field("passes", &self.pass_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl TaskEngine {
    /// Creates an engine bound to the current Tokio runtime.
    ///
    /// # Errors
    /// Returns [`DaqError::NoRuntime`] when called outside a runtime.
    pub fn new(owner: Arc<dyn EngineOwner>, config: EngineConfig) -> AppResult<Self> {
        let runtime = Handle::try_current().map_err(|_| DaqError::NoRuntime)?;
        Ok(Self::with_handle(runtime, owner, config))
    }

    /// Creates an engine that spawns onto `runtime`.
    pub fn with_handle(runtime: Handle, owner: Arc<dyn EngineOwner>, config: EngineConfig) -> Self {
        info!(
            max_wait = ?config.max_wait,
            max_retries = config.recovery.max_retries,
            "Task engine created"
        );
        Self {
            inner: Arc::new(EngineInner {
                registry: Mutex::new(HashMap::new()),
                signals: Signals {
                    wake: Arc::new(Notify::new()),
                    running: Arc::new(AtomicBool::new(false)),
                },
                passes: AtomicU64::new(0),
                owner,
                config,
                runtime,
            }),
        }
    }

    /// Registers `action` under `name` and starts its first activation
    /// immediately.
    ///
    /// # Errors
    /// Returns [`DaqError::DuplicateName`] if `name` is taken; the existing
    /// registration is not touched.
    pub fn register<A>(&self, name: impl Into<String>, action: A, schedule: Schedule) -> AppResult<()>
    where
        A: BackgroundOperation,
    {
        self.register_arc(name, Arc::new(action), schedule)
    }

    /// Same as [`register`](Self::register) for an already shared operation.
    pub fn register_arc(
        &self,
        name: impl Into<String>,
        action: Arc<dyn BackgroundOperation>,
        schedule: Schedule,
    ) -> AppResult<()> {
        let name = name.into();
        {
            let mut registry = self.inner.registry.lock();
            if registry.contains_key(&name) {
                return Err(DaqError::DuplicateName(name));
            }
            let mut entry = OperationEntry::new(action, schedule);
            entry.launch(&self.inner.runtime, &self.inner.signals, Duration::ZERO);
            registry.insert(name.clone(), entry);
        }
        info!(operation = %name, ?schedule, "Operation registered");
        self.inner.signals.wake.notify_one();
        Ok(())
    }

    /// Removes `name` from the registry, aborting its in-flight activation.
    /// Returns false if no such operation was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.inner.registry.lock().remove(name);
        match removed {
            Some(mut entry) => {
                entry.abort();
                info!(operation = name, "Operation unregistered");
                self.inner.signals.wake.notify_one();
                true
            }
            None => false,
        }
    }

    /// Spawns the pass loop on the engine's runtime.
    pub fn start(&self) -> JoinHandle<()> {
        self.inner.signals.running.store(true, Ordering::SeqCst);
        let engine = self.clone();
        self.inner.runtime.spawn(async move { engine.supervise().await })
    }

    /// Runs the pass loop on the current task until [`stop`](Self::stop).
    pub async fn run(&self) {
        self.inner.signals.running.store(true, Ordering::SeqCst);
        self.supervise().await;
    }

    /// Asks the pass loop to exit after the current pass. In-flight
    /// activations are left to finish.
    pub fn stop(&self) {
        self.inner.signals.running.store(false, Ordering::SeqCst);
        self.inner.signals.wake.notify_one();
        info!("Task engine stop requested");
    }

    /// Stops the pass loop and aborts every in-flight activation. The
    /// registry itself is kept: aborted operations go back to
    /// [`OperationStatus::NotStarted`] and are relaunched by the first pass
    /// after the next [`start`](Self::start).
    pub fn shutdown(&self) {
        self.stop();
        let mut registry = self.inner.registry.lock();
        for (name, entry) in registry.iter_mut() {
            if entry.is_active() {
                entry.abort();
                entry.status = OperationStatus::NotStarted;
                debug!(operation = %name, "Activation aborted by shutdown");
            }
        }
    }

    /// True while the pass loop is meant to be running.
    pub fn is_running(&self) -> bool {
        self.inner.signals.running.load(Ordering::SeqCst)
    }

    /// Number of completed passes.
    pub fn pass_count(&self) -> u64 {
        self.inner.passes.load(Ordering::SeqCst)
    }

    /// True if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.registry.lock().contains_key(name)
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.registry.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Bookkeeping snapshot for `name`.
    pub fn info(&self, name: &str) -> Option<OperationInfo> {
        self.inner.registry.lock().get(name).map(|entry| entry.info(name))
    }

    /// Bookkeeping snapshots for every operation, sorted by name.
    pub fn list(&self) -> Vec<OperationInfo> {
        let registry = self.inner.registry.lock();
        let mut infos: Vec<OperationInfo> = registry
            .iter()
            .map(|(name, entry)| entry.info(name))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    async fn supervise(&self) {
        info!("Task engine supervision loop started");
        while self.is_running() {
            self.run_pass();
            if !self.is_running() {
                break;
            }
            let _ = tokio::time::timeout(
                self.inner.config.max_wait,
                self.inner.signals.wake.notified(),
            )
            .await;
        }
        info!(passes = self.pass_count(), "Task engine supervision loop stopped");
    }

    /// Executes one supervision pass and returns its summary.
    ///
    /// Operations left idle by [`stop`](Self::stop) or
    /// [`shutdown`](Self::shutdown) are only relaunched while the engine is
    /// running.
    pub fn run_pass(&self) -> PassReport {
        let pass = self.inner.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = PassReport {
            pass,
            ..PassReport::default()
        };
        let mut failures: Vec<(String, DaqError)> = Vec::new();
        let running = self.is_running();

        {
            let mut registry = self.inner.registry.lock();
            let mut drained = Vec::new();

            for (name, entry) in registry.iter_mut() {
                match entry.take_outcome() {
                    None => {
                        if entry.is_active() {
                            report.running += 1;
                        } else if entry.status == OperationStatus::Failed {
                            report.failed += 1;
                        } else if entry.status == OperationStatus::NotStarted && running {
                            debug!(operation = %name, "Relaunching operation aborted by shutdown");
                            self.launch(entry, Duration::ZERO);
                            report.restarted += 1;
                        }
                    }
                    Some(Outcome::Skipped) if running => {
                        debug!(operation = %name, "Delayed activation skipped; relaunching");
                        self.launch(entry, Duration::ZERO);
                        report.restarted += 1;
                    }
                    Some(Outcome::Skipped) => {
                        entry.status = OperationStatus::NotStarted;
                    }
                    Some(Outcome::Finished(Ok(()))) => {
                        entry.consecutive_failures = 0;
                        entry.reported = false;
                        entry.last_error = None;
                        entry.status = OperationStatus::ExitedClean;
                        match entry.schedule {
                            Schedule::Periodic(interval) => {
                                self.launch(entry, interval);
                                report.restarted += 1;
                            }
                            Schedule::Once => drained.push(name.clone()),
                        }
                    }
                    Some(Outcome::Finished(Err(err))) => {
                        entry.consecutive_failures += 1;
                        entry.last_error = Some(format!("{err:#}"));
                        let decision = self
                            .inner
                            .config
                            .recovery
                            .decide(entry.consecutive_failures, entry.reported);

                        match decision.retry_delay() {
                            Some(delay) => {
                                warn!(
                                    operation = %name,
                                    attempt = entry.consecutive_failures,
                                    error = %format!("{err:#}"),
                                    "Background operation failed; retrying"
                                );
                                self.launch(entry, delay);
                                report.retried += 1;
                            }
                            None => {
                                entry.status = OperationStatus::Failed;
                                report.failed += 1;
                            }
                        }

                        if decision.reports() {
                            entry.reported = true;
                            failures.push((
                                name.clone(),
                                DaqError::OperationFailed {
                                    name: name.clone(),
                                    source: err,
                                },
                            ));
                        }
                    }
                }
            }

            for name in drained {
                registry.remove(&name);
                debug!(operation = %name, "One-shot operation drained");
                report.drained += 1;
            }
        }

        for (name, err) in &failures {
            self.inner.owner.handle_error(name, err);
        }
        self.inner.owner.on_pass(&report);
        report
    }

    fn launch(&self, entry: &mut OperationEntry, delay: Duration) {
        entry.launch(&self.inner.runtime, &self.inner.signals, delay);
    }
}
