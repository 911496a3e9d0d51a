//! TOML configuration for the controller and its solver.
//!
//! ```toml
//! horizon = 10
//! dt = 0.01
//! ctrl_freq = 1000.0
//! max_iter = 1
//! t_track = 5.0
//! t_total = 20.0
//! run_sim = true
//! frame_translation_ref = [0.6, 0.0, 0.4]
//!
//! [solver]
//! variant = "boyd"
//! admm_max_iter = 50
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::solver::SolverSettings;

const DEFAULT_HORIZON: usize = 10;
const DEFAULT_DT: f64 = 1e-2;
const DEFAULT_CTRL_FREQ: f64 = 1000.0;
const DEFAULT_MAX_ITER: usize = 1;
const DEFAULT_WARMUP_MAX_ITER: usize = 100;
const DEFAULT_TRACKING_WEIGHT: f64 = 30.0;
const DEFAULT_CIRCLE_RADIUS: f64 = 0.07;
const DEFAULT_CIRCLE_OMEGA: f64 = 3.0;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Loading of TOML configuration files followed by semantic validation.
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
/// - Returns `ConfigError::ValidationError` if semantic validation fails
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Semantic checks run after parsing.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Parse and validate configuration from a TOML string.
    fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;
        Self::from_toml_str(&content)
    }
}

/// What to command when a solve overruns its cycle budget.
///
/// The solve itself is never preempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeadlinePolicy {
    /// Always command the freshly solved action, however late.
    #[default]
    BestEffort,
    /// Re-send the previous command when the solve took longer than the budget.
    HoldPrevious,
}

/// MPC controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of OCP intervals `N_h`.
    pub horizon: usize,
    /// OCP discretisation step [s].
    pub dt: f64,
    /// Control loop frequency [Hz].
    pub ctrl_freq: f64,
    /// Outer iteration budget per control cycle.
    pub max_iter: usize,
    /// Outer iteration budget of the warm-up solve.
    pub warmup_max_iter: usize,
    /// Time at which the tracking phase starts [s].
    pub t_track: f64,
    /// Total experiment duration [s].
    pub t_total: f64,
    /// Simulation commands raw torque, hardware commands torque minus gravity.
    pub run_sim: bool,
    /// Absolute end-effector position the reach phase targets.
    pub frame_translation_ref: [f64; 3],
    /// Weight of the translation term once tracking starts.
    pub tracking_weight: f64,
    pub circle_radius: f64,
    /// Angular rate of the tracked circle [rad/s].
    pub circle_omega: f64,
    pub deadline: DeadlinePolicy,
    /// Cycle budget [s]; defaults to the control period.
    pub cycle_budget: Option<f64>,
    pub solver: SolverSettings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            horizon: DEFAULT_HORIZON,
            dt: DEFAULT_DT,
            ctrl_freq: DEFAULT_CTRL_FREQ,
            max_iter: DEFAULT_MAX_ITER,
            warmup_max_iter: DEFAULT_WARMUP_MAX_ITER,
            t_track: 5.0,
            t_total: 20.0,
            run_sim: true,
            frame_translation_ref: [0.6, 0.0, 0.4],
            tracking_weight: DEFAULT_TRACKING_WEIGHT,
            circle_radius: DEFAULT_CIRCLE_RADIUS,
            circle_omega: DEFAULT_CIRCLE_OMEGA,
            deadline: DeadlinePolicy::default(),
            cycle_budget: None,
            solver: SolverSettings::default(),
        }
    }
}

impl ControllerConfig {
    /// Control period [s].
    pub fn dt_ctrl(&self) -> f64 {
        1.0 / self.ctrl_freq
    }

    /// Number of control cycles per OCP interval.
    pub fn ocp_to_ctrl_ratio(&self) -> usize {
        ((self.dt / self.dt_ctrl()).round() as usize).max(1)
    }

    /// Control cycle at which the tracking phase starts.
    pub fn track_start_cycle(&self) -> usize {
        (self.t_track / self.dt_ctrl()).round() as usize
    }

    /// Solve budget per cycle.
    pub fn cycle_budget(&self) -> f64 {
        self.cycle_budget.unwrap_or_else(|| self.dt_ctrl())
    }
}

impl ConfigLoader for ControllerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.horizon == 0 {
            return Err(ConfigError::ValidationError(
                "horizon must be at least 1".to_string(),
            ));
        }
        if !(self.ctrl_freq > 0.0) || !(self.dt > 0.0) {
            return Err(ConfigError::ValidationError(
                "dt and ctrl_freq must be positive".to_string(),
            ));
        }
        if self.dt < self.dt_ctrl() {
            return Err(ConfigError::ValidationError(format!(
                "OCP step {} is shorter than the control period {}",
                self.dt,
                self.dt_ctrl()
            )));
        }
        if self.t_track < 0.0 || self.t_total < self.t_track {
            return Err(ConfigError::ValidationError(
                "t_track must lie within [0, t_total]".to_string(),
            ));
        }
        if matches!(self.cycle_budget, Some(b) if !(b > 0.0)) {
            return Err(ConfigError::ValidationError(
                "cycle_budget must be positive".to_string(),
            ));
        }
        self.solver.validate()
    }
}
