//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by the task engine,
//! the scan orchestrator and the drift-correction algorithm. Using the `thiserror`
//! crate, it provides a centralized and consistent way to handle the failures that
//! can occur while supervising background work and driving a scan.
//!
//! ## Error Hierarchy
//!
//! - **`DuplicateName`**: an operation was registered under a name that the task
//!   engine already supervises. The existing registration is left untouched.
//! - **`OperationFailed`**: a supervised background operation returned an error or
//!   panicked and could not be recovered within the engine's recovery policy. This is
//!   the error handed to `EngineOwner::handle_error`.
//! - **`NoSignal`**: drift correction could not compute a centroid because nothing
//!   remained after background subtraction.
//! - **`InvalidTransition`**: a scan command arrived in a mode that does not define it,
//!   e.g. `scan()` while already mapping.
//! - **`InvalidMap`**: a raster map was constructed with a degenerate geometry.
//! - **`Hardware`**: wraps failures reported by the positioning or counting
//!   collaborators. These are `anyhow` errors at the trait seam.
//! - **`Config`**: configuration could not be loaded or failed validation.
//! - **`NoRuntime`**: the task engine was created outside a Tokio runtime.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types with
//! the `?` operator.

use crate::scan::Mode;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Operation '{0}' is already registered")]
    DuplicateName(String),

    #[error("Operation '{name}' failed: {source:#}")]
    OperationFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("No signal above background (total weight {total:.3e}); drift correction skipped")]
    NoSignal { total: f64 },

    #[error("Command '{command}' is not valid in mode {mode}")]
    InvalidTransition { command: &'static str, mode: Mode },

    #[error("Invalid raster map: {0}")]
    InvalidMap(String),

    #[error("Hardware error: {0:#}")]
    Hardware(#[from] anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Task engine requires a running Tokio runtime")]
    NoRuntime,
}
