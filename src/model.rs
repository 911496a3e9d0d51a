//! Interfaces of the dynamics and cost collaborators the solver is built on.

use std::fmt;

use nalgebra::{DMatrix, DVector, Vector3};

use crate::error::MpcError;

/// Position map of the controlled end-effector frame.
pub trait FrameKinematics {
    /// World position of the frame for joint configuration `q`.
    fn frame_translation(&self, q: &DVector<f64>) -> Vector3<f64>;

    /// Position Jacobian of the frame w.r.t. the joint velocities (3 x nv).
    fn frame_jacobian(&self, q: &DVector<f64>) -> DMatrix<f64>;
}

/// Discrete-time dynamics `x+ = f(x, u)` with `x = [q; v]`.
///
/// Implementations must be deterministic and side-effect free.
pub trait DynamicsModel {
    fn nq(&self) -> usize;
    fn nv(&self) -> usize;
    fn nu(&self) -> usize;

    fn nx(&self) -> usize {
        self.nq() + self.nv()
    }

    /// Next state.
    fn step(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64>;

    /// Jacobians `(df/dx, df/du)` at `(x, u)`.
    fn linearize(&self, x: &DVector<f64>, u: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>);

    /// Joint torque balancing gravity at rest in configuration `q`.
    fn gravity_torque(&self, _q: &DVector<f64>) -> DVector<f64> {
        DVector::zeros(self.nu())
    }

    /// Kinematics of the end-effector frame, if the model has one.
    fn kinematics(&self) -> Option<&dyn FrameKinematics> {
        None
    }
}

/// Stable keys of the cost terms the controller manipulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CostTerm {
    StateRegularization,
    ControlRegularization,
    FrameTranslation,
}

impl CostTerm {
    pub const ALL: [CostTerm; 3] = [
        CostTerm::StateRegularization,
        CostTerm::ControlRegularization,
        CostTerm::FrameTranslation,
    ];

    /// Row of the term in per-stage tables.
    pub const fn index(self) -> usize {
        match self {
            CostTerm::StateRegularization => 0,
            CostTerm::ControlRegularization => 1,
            CostTerm::FrameTranslation => 2,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            CostTerm::StateRegularization => "stateReg",
            CostTerm::ControlRegularization => "ctrlReg",
            CostTerm::FrameTranslation => "translation",
        }
    }
}

impl fmt::Display for CostTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Quadratic expansion of a stage cost.
///
/// On the terminal stage the control blocks are empty.
#[derive(Debug, Clone)]
pub struct CostData {
    pub value: f64,
    pub lx: DVector<f64>,
    pub lu: DVector<f64>,
    pub lxx: DMatrix<f64>,
    pub luu: DMatrix<f64>,
    /// Mixed block `d2l/du dx` (nu x nx).
    pub lux: DMatrix<f64>,
}

impl CostData {
    pub fn zeros(nx: usize, nu: usize) -> Self {
        Self {
            value: 0.0,
            lx: DVector::zeros(nx),
            lu: DVector::zeros(nu),
            lxx: DMatrix::zeros(nx, nx),
            luu: DMatrix::zeros(nu, nu),
            lux: DMatrix::zeros(nu, nx),
        }
    }
}

/// Stage-wise cost `l_k(x, u)` over stages `0..=N` (stage `N` is terminal).
///
/// The three mutators let task phases retarget the problem without rebuilding it.
pub trait CostModel {
    /// Cost, gradient and Hessian at stage `stage`. `u` is `None` on the terminal stage.
    fn evaluate(&self, stage: usize, x: &DVector<f64>, u: Option<&DVector<f64>>) -> CostData;

    fn value(&self, stage: usize, x: &DVector<f64>, u: Option<&DVector<f64>>) -> f64 {
        self.evaluate(stage, x, u).value
    }

    /// Switch a term on or off on every stage.
    fn activate_term(&mut self, term: CostTerm, active: bool) -> Result<(), MpcError>;

    fn set_reference(
        &mut self,
        term: CostTerm,
        stage: usize,
        reference: &DVector<f64>,
    ) -> Result<(), MpcError>;

    fn set_weight(&mut self, term: CostTerm, stage: usize, weight: f64) -> Result<(), MpcError>;
}
