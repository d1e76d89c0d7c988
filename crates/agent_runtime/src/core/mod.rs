//! # Core Runtime Module
//!
//! Shared configuration for the runtime subsystems.
//!
//! ## Organization
//!
//! - **Config**: Simulation settings (clock behaviour, logging)
//! - **Foundation**: Low-level utilities (math, time, logging)

pub mod config;

// Re-export foundation modules for convenience
pub use crate::foundation;

pub use config::{SimulationConfig, Config, ConfigError};
