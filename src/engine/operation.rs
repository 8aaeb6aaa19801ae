//! Background operation trait, schedules and registry entries.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A unit of supervised work.
///
/// `run` is invoked once per activation. Returning `Ok(())` is a clean exit;
/// returning an error or panicking is a failure that the engine retries
/// according to its [`RecoveryPolicy`](crate::error_recovery::RecoveryPolicy).
/// Implementations may block on device I/O for as long as they need; the
/// engine never preempts a running invocation except on `unregister`.
#[async_trait]
pub trait BackgroundOperation: Send + Sync + 'static {
    /// Performs one activation of the operation.
    async fn run(&self) -> Result<()>;
}

/// Adapter turning an async closure into a [`BackgroundOperation`].
pub struct FnOperation<F> {
    f: F,
}

/// Wraps `f` so it can be registered with the task engine.
///
/// ```rust,ignore
/// engine.register("heartbeat", from_fn(|| async { Ok(()) }), Schedule::every_secs(1.0))?;
/// ```
pub fn from_fn<F, Fut>(f: F) -> FnOperation<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnOperation { f }
}

#[async_trait]
impl<F, Fut> BackgroundOperation for FnOperation<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self) -> Result<()> {
        (self.f)().await
    }
}

/// When an operation is re-invoked after a clean exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Run once; drained from the registry after a clean exit.
    Once,
    /// Restart `interval` after every clean exit.
    Periodic(#[serde(with = "humantime_serde")] Duration),
}

impl Schedule {
    /// Periodic schedule with an interval given in seconds. Negative values
    /// are clamped to zero.
    pub fn every_secs(secs: f64) -> Self {
        Schedule::Periodic(Duration::from_secs_f64(secs.max(0.0)))
    }

    /// True for periodic schedules.
    pub fn is_periodic(&self) -> bool {
        matches!(self, Schedule::Periodic(_))
    }

    /// Restart interval, if periodic.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Schedule::Once => None,
            Schedule::Periodic(interval) => Some(*interval),
        }
    }
}

/// Lifecycle of a registered operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Registered but no activation has been launched.
    NotStarted,
    /// Launched and sleeping before its next activation.
    Waiting,
    /// Currently executing `run`.
    Running,
    /// Last activation exited cleanly (non-periodic operations are drained
    /// right after reaching this state).
    ExitedClean,
    /// Failed and left stopped by the recovery policy.
    Failed,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not-started",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::ExitedClean => "exited-clean",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of an operation's bookkeeping, as reported by the engine.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperationInfo {
    /// Registry key
    pub name: String,
    /// Restart schedule
    pub schedule: Schedule,
    /// Current lifecycle state
    pub status: OperationStatus,
    /// Number of activations that have started
    pub invocations: u64,
    /// Failures since the last clean exit
    pub consecutive_failures: u32,
    /// Display form of the most recent error, cleared on a clean exit
    pub last_error: Option<String>,
}

/// How a single activation ended.
pub(crate) enum Outcome {
    /// `run` returned; panics are folded into `Err`.
    Finished(Result<()>),
    /// The engine was stopped while the activation was still sleeping.
    Skipped,
}

/// Signals shared between the engine and every activation task.
#[derive(Clone)]
pub(crate) struct Signals {
    pub wake: Arc<Notify>,
    pub running: Arc<AtomicBool>,
}

/// Notifies the pass loop when an activation task ends, including by panic or abort.
struct WakeOnExit(Arc<Notify>);

impl Drop for WakeOnExit {
    fn drop(&mut self) {
        self.0.notify_one();
    }
}

/// Registry record for one operation.
pub(crate) struct OperationEntry {
    pub action: Arc<dyn BackgroundOperation>,
    pub schedule: Schedule,
    pub status: OperationStatus,
    handle: Option<JoinHandle<()>>,
    outcome: Arc<Mutex<Option<Outcome>>>,
    invocations: Arc<AtomicU64>,
    launched_at: u64,
    pub consecutive_failures: u32,
    pub reported: bool,
    pub last_error: Option<String>,
}

impl OperationEntry {
    pub fn new(action: Arc<dyn BackgroundOperation>, schedule: Schedule) -> Self {
        Self {
            action,
            schedule,
            status: OperationStatus::NotStarted,
            handle: None,
            outcome: Arc::new(Mutex::new(None)),
            invocations: Arc::new(AtomicU64::new(0)),
            launched_at: 0,
            consecutive_failures: 0,
            reported: false,
            last_error: None,
        }
    }

    /// Spawns one activation, optionally delayed. A delayed activation that
    /// wakes up after the engine was stopped does not invoke `run`.
    pub fn launch(&mut self, runtime: &Handle, signals: &Signals, delay: Duration) {
        let action = Arc::clone(&self.action);
        let outcome = Arc::clone(&self.outcome);
        let invocations = Arc::clone(&self.invocations);
        let guard = WakeOnExit(Arc::clone(&signals.wake));
        let running = Arc::clone(&signals.running);

        self.launched_at = self.invocations.load(Ordering::SeqCst);
        self.status = if delay.is_zero() {
            OperationStatus::Running
        } else {
            OperationStatus::Waiting
        };

        self.handle = Some(runtime.spawn(async move {
            let _guard = guard;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
                if !running.load(Ordering::SeqCst) {
                    *outcome.lock() = Some(Outcome::Skipped);
                    return;
                }
            }
            invocations.fetch_add(1, Ordering::SeqCst);
            let result = AssertUnwindSafe(action.run())
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(anyhow!("panicked: {}", panic_message(&*panic))));
            *outcome.lock() = Some(Outcome::Finished(result));
        }));
    }

    /// Takes the outcome of the last activation if it has ended.
    pub fn take_outcome(&mut self) -> Option<Outcome> {
        let outcome = self.outcome.lock().take();
        if outcome.is_some() {
            self.handle = None;
        }
        outcome
    }

    /// True while an activation task exists.
    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// Aborts the in-flight activation, if any.
    pub fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Status as seen from outside; a delayed activation reports `Running`
    /// once `run` has actually started.
    pub fn current_status(&self) -> OperationStatus {
        match self.status {
            OperationStatus::Waiting if self.invocations() > self.launched_at => {
                OperationStatus::Running
            }
            status => status,
        }
    }

    pub fn info(&self, name: &str) -> OperationInfo {
        OperationInfo {
            name: name.to_string(),
            schedule: self.schedule,
            status: self.current_status(),
            invocations: self.invocations(),
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error.clone(),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_helpers() {
        assert!(!Schedule::Once.is_periodic());
        assert_eq!(Schedule::Once.interval(), None);
        let periodic = Schedule::every_secs(0.5);
        assert!(periodic.is_periodic());
        assert_eq!(periodic.interval(), Some(Duration::from_millis(500)));
        assert_eq!(Schedule::every_secs(-3.0).interval(), Some(Duration::ZERO));
    }

    #[test]
    fn test_panic_payloads_are_readable() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(&*boxed), "kaboom");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*boxed), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_launched_entry_records_outcome() {
        let signals = Signals {
            wake: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(true)),
        };
        let mut entry = OperationEntry::new(
            Arc::new(from_fn(|| async { Err(anyhow!("no counts")) })),
            Schedule::Once,
        );
        entry.launch(&Handle::current(), &signals, Duration::ZERO);
        signals.wake.notified().await;

        match entry.take_outcome() {
            Some(Outcome::Finished(Err(err))) => assert_eq!(err.to_string(), "no counts"),
            _ => panic!("expected a failed outcome"),
        }
        assert!(!entry.is_active());
        assert_eq!(entry.invocations(), 1);
    }
}
