//! Receding-horizon control of robot manipulators on top of a constrained
//! DDP solver.
//!
//! Constraints are handled by ADMM: each outer iteration linearizes the
//! problem, then alternates a penalty-augmented Riccati backward pass with a
//! box projection of the constraint values until primal and dual residuals
//! fall below tolerance. The penalty adapts either per constraint row
//! ([`AdmmVariant::Sparse`]) or as one scalar ([`AdmmVariant::Boyd`]).
//! A line search on an l1 merit function accepts the step.
//!
//! [`MpcController`] wraps one persistent [`Solver`] into a sense, solve and
//! command loop with warm starts and a reach-then-track task.

mod admm;
mod backward;
pub mod config;
pub mod constraint;
pub mod controller;
mod error;
mod forward;
pub mod model;
pub mod models;
pub mod rho;
mod solver;
mod trajectory;

pub use admm::{AdmmState, Residuals, project_box};
pub use config::{ConfigError, ConfigLoader, ControllerConfig, DeadlinePolicy};
pub use constraint::{ConstraintData, ConstraintModel, RowClass, StageKind, StageLayout};
pub use controller::{
    ActuatorChannel, ActuatorInterface, CircleReference, CycleReport, MpcController,
    SensorChannel, SensorInterface, TaskPhase,
};
pub use error::MpcError;
pub use model::{CostData, CostModel, CostTerm, DynamicsModel, FrameKinematics};
pub use rho::{AdmmVariant, BoydPenalty, PenaltyAdaptation, PenaltyLimits, SparsePenalty};
pub use solver::{Solver, SolverSettings, SolverState, StageData};
pub use trajectory::shift_trajectory;
