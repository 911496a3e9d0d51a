use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::error::MpcError;
use crate::model::{CostData, CostModel, CostTerm, FrameKinematics};

/// Activation, weight and reference of one cost term on every knot point.
#[derive(Debug, Clone)]
struct TermTable {
    active: bool,
    weights: Vec<f64>,
    references: Vec<DVector<f64>>,
}

impl TermTable {
    fn new(stages: usize, dim: usize) -> Self {
        Self {
            active: false,
            weights: vec![0.0; stages],
            references: vec![DVector::zeros(dim); stages],
        }
    }

    fn weight(&self, stage: usize) -> Option<f64> {
        let w = self.weights[stage];
        (self.active && w != 0.0).then_some(w)
    }

    fn set_reference(&mut self, stage: usize, reference: &DVector<f64>) -> Result<(), MpcError> {
        let dim = self.references[stage].len();
        if reference.len() != dim {
            return Err(MpcError::DimensionMismatch {
                what: "cost reference",
                expected: dim,
                actual: reference.len(),
            });
        }
        self.references[stage].copy_from(reference);
        Ok(())
    }
}

fn check_stage(stage: usize, stages: usize) -> Result<(), MpcError> {
    if stage < stages {
        Ok(())
    } else {
        Err(MpcError::StageOutOfRange {
            stage,
            horizon: stages - 1,
        })
    }
}

/// Weighted sum of state regularization, control regularization and
/// end-effector translation residuals, with Gauss-Newton Hessians.
///
/// Control regularization is skipped on the terminal knot point.
#[derive(Debug, Clone)]
pub struct TrackingCost<K> {
    kinematics: K,
    nq: usize,
    nx: usize,
    nu: usize,
    /// Diagonal activation of the state residual.
    state_activation: DVector<f64>,
    terms: [TermTable; 3],
}

impl<K: FrameKinematics> TrackingCost<K> {
    /// All terms inactive with zero weight and reference.
    pub fn new(kinematics: K, nq: usize, nv: usize, nu: usize, horizon: usize) -> Self {
        let stages = horizon + 1;
        let nx = nq + nv;
        Self {
            kinematics,
            nq,
            nx,
            nu,
            state_activation: DVector::from_element(nx, 1.0),
            terms: [
                TermTable::new(stages, nx),
                TermTable::new(stages, nu),
                TermTable::new(stages, 3),
            ],
        }
    }

    /// Activate `term` with the same weight and reference on every knot point.
    pub fn with_term(
        mut self,
        term: CostTerm,
        weight: f64,
        reference: &DVector<f64>,
    ) -> Result<Self, MpcError> {
        let table = &mut self.terms[term.index()];
        for stage in 0..table.weights.len() {
            table.weights[stage] = weight;
            table.set_reference(stage, reference)?;
        }
        table.active = true;
        Ok(self)
    }

    pub fn with_state_activation(mut self, activation: DVector<f64>) -> Result<Self, MpcError> {
        if activation.len() != self.nx {
            return Err(MpcError::DimensionMismatch {
                what: "state activation",
                expected: self.nx,
                actual: activation.len(),
            });
        }
        self.state_activation = activation;
        Ok(self)
    }

    pub fn is_active(&self, term: CostTerm) -> bool {
        self.terms[term.index()].active
    }

    pub fn weight(&self, term: CostTerm, stage: usize) -> f64 {
        self.terms[term.index()].weights[stage]
    }

    pub fn reference(&self, term: CostTerm, stage: usize) -> &DVector<f64> {
        &self.terms[term.index()].references[stage]
    }

    fn stages(&self) -> usize {
        self.terms[0].weights.len()
    }
}

impl<K: FrameKinematics> CostModel for TrackingCost<K> {
    fn evaluate(&self, stage: usize, x: &DVector<f64>, u: Option<&DVector<f64>>) -> CostData {
        let nu = if u.is_some() { self.nu } else { 0 };
        let mut data = CostData::zeros(self.nx, nu);

        let state = &self.terms[CostTerm::StateRegularization.index()];
        if let Some(w) = state.weight(stage) {
            let r = x - &state.references[stage];
            let ar = self.state_activation.component_mul(&r);
            data.value += 0.5 * w * r.dot(&ar);
            data.lx += ar * w;
            data.lxx += DMatrix::from_diagonal(&self.state_activation) * w;
        }

        let control = &self.terms[CostTerm::ControlRegularization.index()];
        if let (Some(w), Some(u)) = (control.weight(stage), u) {
            let r = u - &control.references[stage];
            data.value += 0.5 * w * r.norm_squared();
            data.lu += r * w;
            for i in 0..self.nu {
                data.luu[(i, i)] += w;
            }
        }

        let frame = &self.terms[CostTerm::FrameTranslation.index()];
        if let Some(w) = frame.weight(stage) {
            let q = x.rows(0, self.nq).into_owned();
            let p = self.kinematics.frame_translation(&q);
            let r = DVector::from_column_slice(p.as_slice()) - &frame.references[stage];
            let jac = self.kinematics.frame_jacobian(&q);
            let nv = jac.ncols();
            data.value += 0.5 * w * r.norm_squared();
            let mut lx = data.lx.rows_mut(0, nv);
            lx += jac.tr_mul(&r) * w;
            let mut lxx = data.lxx.view_mut((0, 0), (nv, nv));
            lxx += jac.tr_mul(&jac) * w;
        }

        data
    }

    fn activate_term(&mut self, term: CostTerm, active: bool) -> Result<(), MpcError> {
        self.terms[term.index()].active = active;
        Ok(())
    }

    fn set_reference(
        &mut self,
        term: CostTerm,
        stage: usize,
        reference: &DVector<f64>,
    ) -> Result<(), MpcError> {
        check_stage(stage, self.stages())?;
        self.terms[term.index()].set_reference(stage, reference)
    }

    fn set_weight(&mut self, term: CostTerm, stage: usize, weight: f64) -> Result<(), MpcError> {
        check_stage(stage, self.stages())?;
        self.terms[term.index()].weights[stage] = weight;
        Ok(())
    }
}

/// LQ cost `1/2 (x - x_ref)' Q (x - x_ref) + 1/2 (u - u_ref)' R (u - u_ref)`
/// with terminal matrix `P`. Supports the two regularization terms only.
#[derive(Debug, Clone)]
pub struct QuadraticCost {
    q: DMatrix<f64>,
    r: DMatrix<f64>,
    p: DMatrix<f64>,
    state: TermTable,
    control: TermTable,
}

impl QuadraticCost {
    /// Both terms active with unit weight and zero reference.
    pub fn new(horizon: usize, q: DMatrix<f64>, r: DMatrix<f64>, p: DMatrix<f64>) -> Self {
        let stages = horizon + 1;
        let mut state = TermTable::new(stages, q.nrows());
        let mut control = TermTable::new(stages, r.nrows());
        for table in [&mut state, &mut control] {
            table.active = true;
            table.weights.fill(1.0);
        }
        Self {
            q,
            r,
            p,
            state,
            control,
        }
    }

    fn table(&mut self, term: CostTerm) -> Result<&mut TermTable, MpcError> {
        match term {
            CostTerm::StateRegularization => Ok(&mut self.state),
            CostTerm::ControlRegularization => Ok(&mut self.control),
            CostTerm::FrameTranslation => Err(MpcError::UnsupportedTerm(term.name())),
        }
    }
}

impl CostModel for QuadraticCost {
    fn evaluate(&self, stage: usize, x: &DVector<f64>, u: Option<&DVector<f64>>) -> CostData {
        let nu = if u.is_some() { self.r.nrows() } else { 0 };
        let mut data = CostData::zeros(x.len(), nu);

        if let Some(w) = self.state.weight(stage) {
            let hess = if u.is_some() { &self.q } else { &self.p };
            let dx = x - &self.state.references[stage];
            let g = hess * &dx;
            data.value += 0.5 * w * dx.dot(&g);
            data.lx += g * w;
            data.lxx += hess * w;
        }
        if let (Some(w), Some(u)) = (self.control.weight(stage), u) {
            let du = u - &self.control.references[stage];
            let g = &self.r * &du;
            data.value += 0.5 * w * du.dot(&g);
            data.lu += g * w;
            data.luu += &self.r * w;
        }
        data
    }

    fn activate_term(&mut self, term: CostTerm, active: bool) -> Result<(), MpcError> {
        self.table(term)?.active = active;
        Ok(())
    }

    fn set_reference(
        &mut self,
        term: CostTerm,
        stage: usize,
        reference: &DVector<f64>,
    ) -> Result<(), MpcError> {
        check_stage(stage, self.state.weights.len())?;
        self.table(term)?.set_reference(stage, reference)
    }

    fn set_weight(&mut self, term: CostTerm, stage: usize, weight: f64) -> Result<(), MpcError> {
        check_stage(stage, self.state.weights.len())?;
        self.table(term)?.weights[stage] = weight;
        Ok(())
    }
}

/// Infinite-horizon Riccati matrix of `(A, B, Q, R)` by fixed-point iteration.
///
/// Returns `None` if a reduced Hessian is singular or the iteration does not settle.
pub fn riccati_terminal(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    q: &DMatrix<f64>,
    r: &DMatrix<f64>,
) -> Option<DMatrix<f64>> {
    let at = a.transpose();
    let bt = b.transpose();
    let mut p = q.clone();
    for i in 0..10_000 {
        let k = (r + &bt * &p * b).try_inverse()? * &bt * &p * a;
        let next = q + &at * &p * (a - b * &k);
        let next = (&next + next.transpose()) * 0.5;
        let delta = (&next - &p).amax();
        p = next;
        if delta < 1e-12 * (1.0 + p.amax()) {
            debug!("Riccati iteration converged after {} iterations", i + 1);
            return Some(p);
        }
    }
    None
}
