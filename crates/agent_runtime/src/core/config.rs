//! # Simulation Configuration
//!
//! Settings that drive the clock and the logging setup of a simulation run.
//! Loaded from TOML or RON through the [`Config`] trait.

use serde::{Serialize, Deserialize};

pub use crate::config::{Config, ConfigError};
use crate::foundation::time::DEFAULT_FIXED_DELTA_MS;

/// # Simulation Configuration
///
/// Clock behaviour plus the default log filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Default log filter (overridable through `RUST_LOG`)
    pub log_level: String,
    /// Report `fixed_delta` every tick instead of measured time
    pub use_fixed_delta: bool,
    /// Fixed step in seconds
    pub fixed_delta: f64,
    /// Rate at which simulated time passes
    pub timescale: f64,
    /// Angular tolerance (radians) under which `rotate_to` reports "facing"
    pub turn_tolerance: f32,
}

impl SimulationConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self {
            log_level: "info".to_string(),
            use_fixed_delta: false,
            fixed_delta: DEFAULT_FIXED_DELTA_MS / 1000.0,
            timescale: 1.0,
            turn_tolerance: 1e-4,
        }
    }

    /// Set log level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Use a fixed step of `seconds` per tick
    pub fn with_fixed_delta(mut self, seconds: f64) -> Self {
        self.use_fixed_delta = true;
        self.fixed_delta = seconds;
        self
    }

    /// Set timescale
    pub fn with_timescale(mut self, timescale: f64) -> Self {
        self.timescale = timescale;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fixed_delta.is_finite() && self.fixed_delta > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "fixed_delta must be a positive number of seconds, got {}",
                self.fixed_delta
            )));
        }

        if !self.timescale.is_finite() {
            return Err(ConfigError::Invalid("timescale must be finite".to_string()));
        }

        if self.timescale < 0.0 {
            log::warn!("Negative timescale {}: elapsed time will decrease", self.timescale);
        }

        if self.turn_tolerance < 0.0 {
            return Err(ConfigError::Invalid("turn_tolerance cannot be negative".to_string()));
        }

        Ok(())
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Config for SimulationConfig {}
