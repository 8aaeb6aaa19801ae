//! Configuration System using Figment
//!
//! Configuration is loaded from, in increasing order of precedence:
//! 1. built-in defaults,
//! 2. an optional TOML file,
//! 3. environment variables prefixed with `SCAN_DAQ_`.
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore, so field names may keep
//! their single underscores:
//!
//! ```text
//! SCAN_DAQ_APPLICATION__LOG_LEVEL=debug
//! SCAN_DAQ_SCAN__OPTIMISATION_INTERVAL="45s"
//! SCAN_DAQ_ENGINE__RECOVERY__ON_EXHAUSTED=keep_retrying
//! ```
//!
//! # Example
//!
//! ```no_run
//! use scan_daq::config::DaqConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = DaqConfig::load(None)?;
//!     println!("Application: {}", config.application.name);
//!     println!("Optimising every {:?}", config.scan.optimisation_interval);
//!     Ok(())
//! }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::EmitterModel;
use crate::scan::drift::DEFAULT_BACKGROUND_PERCENTILE;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "SCAN_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Task engine settings
    pub engine: EngineConfig,
    /// Scan orchestrator settings
    pub scan: ScanConfig,
    /// Simulated hardware settings
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Scan orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Minimum time between automatic drift corrections
    #[serde(default = "default_optimisation_interval", with = "humantime_serde")]
    pub optimisation_interval: Duration,
    /// Cells per side of the corrective map
    #[serde(default = "default_optimisation_size")]
    pub optimisation_size: usize,
    /// Corrective map cell spacing (µm)
    #[serde(default = "default_optimisation_step")]
    pub optimisation_step: f64,
    /// Minimum time between correlation reads
    #[serde(default = "default_correlation_interval", with = "humantime_serde")]
    pub correlation_interval: Duration,
    /// Percentile used for the background floor during drift estimation
    #[serde(default = "default_background_percentile")]
    pub background_percentile: f64,
    /// Run drift correction periodically while on target
    #[serde(default = "default_true")]
    pub auto_optimisation: bool,
    /// Update the signal ratio after every drift correction
    #[serde(default = "default_true")]
    pub auto_correction: bool,
    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            optimisation_interval: default_optimisation_interval(),
            optimisation_size: default_optimisation_size(),
            optimisation_step: default_optimisation_step(),
            correlation_interval: default_correlation_interval(),
            background_percentile: default_background_percentile(),
            auto_optimisation: true,
            auto_correction: true,
            event_capacity: default_event_capacity(),
        }
    }
}

/// Simulated hardware configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Interval between rate samples
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Stage settle time after each move
    #[serde(default, with = "humantime_serde")]
    pub settle_time: Duration,
    /// Optical model of the simulated sample
    #[serde(default)]
    pub model: EmitterModel,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sample_interval: default_sample_interval(),
            settle_time: Duration::ZERO,
            model: EmitterModel::default(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "scan_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_optimisation_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_optimisation_size() -> usize {
    7
}

fn default_optimisation_step() -> f64 {
    0.1
}

fn default_correlation_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_background_percentile() -> f64 {
    DEFAULT_BACKGROUND_PERCENTILE
}

fn default_true() -> bool {
    true
}

fn default_event_capacity() -> usize {
    256
}

fn default_sample_interval() -> Duration {
    Duration::from_millis(10)
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl DaqConfig {
    /// Layered provider: defaults, then `path` (if any), then the environment.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(DaqConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::Config`] if a source cannot be parsed and
    /// [`DaqError::Configuration`] if validation fails.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Corrective map geometry is non-degenerate
    /// - Background percentile is within 0-100
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let scan = &self.scan;
        if scan.optimisation_size == 0 {
            return Err(DaqError::Configuration(
                "scan.optimisation_size must be at least 1".into(),
            ));
        }
        if !(scan.optimisation_step.is_finite() && scan.optimisation_step > 0.0) {
            return Err(DaqError::Configuration(format!(
                "scan.optimisation_step must be positive, got {}",
                scan.optimisation_step
            )));
        }
        if !(0.0..=100.0).contains(&scan.background_percentile) {
            return Err(DaqError::Configuration(format!(
                "scan.background_percentile {} outside 0-100",
                scan.background_percentile
            )));
        }
        if scan.event_capacity == 0 {
            return Err(DaqError::Configuration(
                "scan.event_capacity must be at least 1".into(),
            ));
        }
        if self.engine.max_wait.is_zero() {
            return Err(DaqError::Configuration(
                "engine.max_wait must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_recovery::ExhaustedAction;

    #[test]
    fn test_defaults() {
        let config = DaqConfig::default();
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.scan.optimisation_interval, Duration::from_secs(30));
        assert_eq!(config.scan.optimisation_size, 7);
        assert_eq!(config.scan.optimisation_step, 0.1);
        assert_eq!(config.scan.correlation_interval, Duration::from_secs(1));
        assert_eq!(config.engine.max_wait, Duration::from_secs(10));
        assert_eq!(config.engine.recovery.max_retries, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "scan.toml",
                r#"
[application]
log_level = "debug"

[scan]
optimisation_interval = "45s"
optimisation_size = 9
auto_correction = false

[engine.recovery]
max_retries = 3
on_exhausted = "keep_retrying"

[simulation.model]
peak_rate = 250.0
"#,
            )?;

            let config: DaqConfig = DaqConfig::figment(Some(Path::new("scan.toml"))).extract()?;
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.application.name, "scan_daq");
            assert_eq!(config.scan.optimisation_interval, Duration::from_secs(45));
            assert_eq!(config.scan.optimisation_size, 9);
            assert_eq!(config.scan.optimisation_step, 0.1);
            assert!(!config.scan.auto_correction);
            assert_eq!(config.engine.recovery.max_retries, 3);
            assert_eq!(config.engine.recovery.on_exhausted, ExhaustedAction::KeepRetrying);
            assert_eq!(config.simulation.model.peak_rate, 250.0);
            assert_eq!(config.simulation.model.background_rate, 10.0);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = DaqConfig::load(Some(Path::new("absent.toml")))
                .map_err(|e| figment::Error::from(e.to_string()))?;
            assert_eq!(config, DaqConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("scan.toml", "[scan]\noptimisation_size = 5\n")?;
            jail.set_env("SCAN_DAQ_SCAN__OPTIMISATION_SIZE", "11");
            jail.set_env("SCAN_DAQ_APPLICATION__LOG_LEVEL", "warn");

            let config = DaqConfig::load(Some(Path::new("scan.toml")))
                .map_err(|e| figment::Error::from(e.to_string()))?;
            assert_eq!(config.scan.optimisation_size, 11);
            assert_eq!(config.application.log_level, "warn");
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = DaqConfig::default();
        config.application.log_level = "verbose".into();
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_degenerate_corrective_map_rejected() {
        let mut config = DaqConfig::default();
        config.scan.optimisation_size = 0;
        assert!(config.validate().is_err());

        let mut config = DaqConfig::default();
        config.scan.background_percentile = 120.0;
        assert!(config.validate().is_err());
    }
}
