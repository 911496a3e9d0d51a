use nalgebra::{DMatrix, DVector};

use crate::error::MpcError;
use crate::model::DynamicsModel;

/// Discrete linear dynamics `x+ = A x + B u`.
///
/// The whole state counts as configuration (`nq = nx`, `nv = 0`).
#[derive(Debug, Clone)]
pub struct LinearDynamics {
    a: DMatrix<f64>, // Nx * Nx
    b: DMatrix<f64>, // Nx * Nu
}

impl LinearDynamics {
    pub fn new(a: DMatrix<f64>, b: DMatrix<f64>) -> Result<Self, MpcError> {
        if !a.is_square() {
            return Err(MpcError::DimensionMismatch {
                what: "A columns",
                expected: a.nrows(),
                actual: a.ncols(),
            });
        }
        if b.nrows() != a.nrows() {
            return Err(MpcError::DimensionMismatch {
                what: "B rows",
                expected: a.nrows(),
                actual: b.nrows(),
            });
        }
        Ok(Self { a, b })
    }

    pub fn a(&self) -> &DMatrix<f64> {
        &self.a
    }

    pub fn b(&self) -> &DMatrix<f64> {
        &self.b
    }
}

impl DynamicsModel for LinearDynamics {
    fn nq(&self) -> usize {
        self.a.nrows()
    }

    fn nv(&self) -> usize {
        0
    }

    fn nu(&self) -> usize {
        self.b.ncols()
    }

    fn step(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        &self.a * x + &self.b * u
    }

    fn linearize(&self, _x: &DVector<f64>, _u: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        (self.a.clone(), self.b.clone())
    }
}
