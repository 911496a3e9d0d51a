use thiserror::Error;

use crate::config::ConfigError;
use crate::controller::{ActuatorChannel, SensorChannel};

/// Errors raised by the solver, its models and the controller.
///
/// Transient non-convergence is not an error: [`crate::Solver::solve`] reports
/// it through its boolean result and the iteration/residual fields.
#[derive(Debug, Clone, Error)]
pub enum MpcError {
    /// A constraint row has `lb > ub` (or a NaN bound). Detected at construction.
    #[error("infeasible bounds at stage {stage}, row {row}: lb = {lb} > ub = {ub}")]
    InfeasibleBounds {
        stage: usize,
        row: usize,
        lb: f64,
        ub: f64,
    },

    /// A constraint model is malformed (wrong sizes, degenerate normal, ...).
    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),

    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// One constraint model per knot point (N + 1) is required.
    #[error("expected {expected} constraint models for horizon {horizon}, got {actual}")]
    HorizonMismatch {
        horizon: usize,
        expected: usize,
        actual: usize,
    },

    /// An end-effector constraint or cost term needs the dynamics' frame kinematics.
    #[error("end-effector term requires frame kinematics, but the model provides none")]
    MissingKinematics,

    #[error("stage {stage} is outside the horizon (0..={horizon})")]
    StageOutOfRange { stage: usize, horizon: usize },

    #[error("cost term {0} is not supported by this cost model")]
    UnsupportedTerm(&'static str),

    /// Regularization saturated without making the control Hessian positive definite.
    #[error("backward pass failed at stage {stage} (regularization {regularization:e})")]
    BackwardPassFailed { stage: usize, regularization: f64 },

    #[error("sensor channel {0:?} unavailable")]
    Sensor(SensorChannel),

    #[error("actuator channel {0:?} rejected the command")]
    Actuator(ActuatorChannel),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
