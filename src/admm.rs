use log::debug;
use nalgebra::DVector;

use crate::constraint::{RowClass, StageLayout};
use crate::error::MpcError;
use crate::model::{CostModel, DynamicsModel};
use crate::rho::{predict_scale, should_rescale};
use crate::solver::{Solver, SolverState, StageData};

/// Max norm; zero for an empty vector.
pub(crate) fn inf_norm(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0, |m: f64, x| m.max(x.abs()))
}

/// Clamp `v` into `[lb, ub]` row by row. Infinite bounds leave the row untouched.
pub fn project_box(v: &mut DVector<f64>, lb: &DVector<f64>, ub: &DVector<f64>) {
    v.zip_zip_apply(lb, ub, |x, min, max| *x = (*x).clamp(min, max));
}

/// Residuals of the last ADMM iteration, over the non-free rows of every knot point.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Residuals {
    /// `max |primal - z|`
    pub primal: f64,
    /// `max |rho * (z - z_prev)|`
    pub dual: f64,
    pub eps_primal: f64,
    pub eps_dual: f64,
    /// Residual-balancing factor the penalty policy would apply.
    pub scale: f64,
}

impl Residuals {
    pub fn converged(&self) -> bool {
        self.primal <= self.eps_primal && self.dual <= self.eps_dual
    }
}

/// Consensus state of the constraint rows, one vector per knot point.
///
/// `z` and the primal live in constraint space (values of `g`), so they stay
/// meaningful across relinearizations. `y` is the unscaled multiplier.
#[derive(Debug, Clone)]
pub struct AdmmState {
    pub z: Vec<DVector<f64>>,
    pub y: Vec<DVector<f64>>,
    pub z_prev: Vec<DVector<f64>>,
    /// Linearized constraint value at the last inner iterate.
    pub primal: Vec<DVector<f64>>,
    pub relaxed: Vec<DVector<f64>>,
    pub residuals: Residuals,
    pub iter: usize,
    pub converged: bool,
    needs_init: Vec<bool>,
}

impl AdmmState {
    pub fn new(layout: &[StageLayout]) -> Self {
        let zeros: Vec<DVector<f64>> = layout.iter().map(|l| DVector::zeros(l.nc())).collect();
        Self {
            z: zeros.clone(),
            y: zeros.clone(),
            z_prev: zeros.clone(),
            primal: zeros.clone(),
            relaxed: zeros,
            residuals: Residuals::default(),
            iter: 0,
            converged: false,
            needs_init: vec![true; layout.len()],
        }
    }

    /// Mark every knot point for re-initialisation from the next linearization.
    pub fn reset(&mut self) {
        self.needs_init.fill(true);
        self.converged = false;
    }

    /// Move knot point `k + 1` into `k`. The tail keeps its values, as the
    /// trajectory shift duplicates its last entries; knot points whose row
    /// count changes are re-initialised.
    pub fn shift(&mut self) {
        let n = self.z.len();
        for k in 0..n.saturating_sub(2) {
            if self.z[k].len() == self.z[k + 1].len() {
                self.z[k] = self.z[k + 1].clone();
                self.y[k] = self.y[k + 1].clone();
                self.needs_init[k] = self.needs_init[k + 1];
            } else {
                self.needs_init[k] = true;
            }
        }
        self.converged = false;
    }

    /// `z = clamp(g)`, `y = 0` on knot points marked for re-initialisation.
    fn initialize(&mut self, stages: &[StageData], layout: &[StageLayout]) {
        for (k, (stage, rows)) in stages.iter().zip(layout).enumerate() {
            if !self.needs_init[k] && self.z[k].len() == rows.nc() {
                continue;
            }
            let mut z = stage.con.g.clone();
            project_box(&mut z, &rows.lb, &rows.ub);
            self.y[k] = DVector::zeros(rows.nc());
            self.primal[k] = stage.con.g.clone();
            self.relaxed[k] = stage.con.g.clone();
            self.z_prev[k] = z.clone();
            self.z[k] = z;
            self.needs_init[k] = false;
        }
    }

    /// Relax, project and take the dual ascent step on knot point `k`.
    fn update_stage(
        &mut self,
        k: usize,
        primal: DVector<f64>,
        rho: &DVector<f64>,
        rows: &StageLayout,
        relaxation: f64,
    ) {
        let relaxed = &primal * relaxation + &self.z_prev[k] * (1.0 - relaxation);
        let mut z = &relaxed + self.y[k].component_div(rho);
        project_box(&mut z, &rows.lb, &rows.ub);
        self.y[k] += rho.component_mul(&(&relaxed - &z));
        self.z[k] = z;
        self.relaxed[k] = relaxed;
        self.primal[k] = primal;
    }

    fn compute_residuals(
        &self,
        rho: &[DVector<f64>],
        layout: &[StageLayout],
        eps_abs: f64,
        eps_rel: f64,
    ) -> Residuals {
        let mut res = Residuals::default();
        let (mut primal_norm, mut dual_norm): (f64, f64) = (0.0, 0.0);
        for (k, rows) in layout.iter().enumerate() {
            for (i, class) in rows.classes.iter().enumerate() {
                if *class == RowClass::Free {
                    continue;
                }
                let (p, z, y) = (self.primal[k][i], self.z[k][i], self.y[k][i]);
                res.primal = res.primal.max((p - z).abs());
                res.dual = res.dual.max((rho[k][i] * (z - self.z_prev[k][i])).abs());
                primal_norm = primal_norm.max(p.abs()).max(z.abs());
                dual_norm = dual_norm.max(y.abs());
            }
        }
        res.eps_primal = eps_abs + eps_rel * primal_norm;
        res.eps_dual = eps_abs + eps_rel * dual_norm;
        res.scale = predict_scale(res.primal, res.dual, primal_norm, dual_norm);
        res
    }
}

impl<D, C> Solver<D, C>
where
    D: DynamicsModel,
    C: CostModel,
{
    /// ADMM inner loop on the current linearization. Leaves the gains of the
    /// last backward pass in `state`; running out of iterations keeps the last
    /// iterate and is not an error.
    pub(crate) fn admm_solve(&self, state: &mut SolverState) -> Result<(), MpcError> {
        let s = &self.settings;
        let n = self.horizon();

        if !s.admm_warm_start {
            state.reset_admm();
        }
        if state.reset_penalty {
            state.penalty.reset(&self.layout, s.rho);
            state.reset_penalty = false;
        }
        state.admm.initialize(&state.stages, &self.layout);
        state.admm.iter = 0;
        state.admm.converged = false;

        for it in 1..=s.admm_max_iter {
            state.admm.z_prev.clone_from(&state.admm.z);

            // Solve the penalized subproblem and roll it out
            self.backward_pass(state)?;
            let (dxs, dus) = self.linear_rollout(state);

            let rho = state.penalty.penalties();
            for k in 0..=n {
                let con = &state.stages[k].con;
                if con.nc() == 0 {
                    continue;
                }
                let mut primal = &con.g + &con.jx * &dxs[k];
                if k < n {
                    primal += &con.ju * &dus[k];
                }
                state
                    .admm
                    .update_stage(k, primal, &rho[k], &self.layout[k], s.relaxation);
            }

            let res = state
                .admm
                .compute_residuals(&rho, &self.layout, s.eps_abs, s.eps_rel);
            state.admm.residuals = res;
            state.admm.iter = it;

            if res.converged() {
                state.admm.converged = true;
                debug!("ADMM converged in {it} iterations");
                break;
            }

            if it % s.rho_update_interval == 0 && should_rescale(res.scale, s.adaptive_rho_tolerance)
            {
                state.penalty.rescale(res.scale);
                debug!("rho rescaled by {:.3e} at ADMM iteration {it}", res.scale);
            }
        }

        if !state.admm.converged {
            debug!(
                "ADMM stopped after {} iterations: primal {:.3e} (eps {:.3e}), dual {:.3e} (eps {:.3e})",
                state.admm.iter,
                state.admm.residuals.primal,
                state.admm.residuals.eps_primal,
                state.admm.residuals.dual,
                state.admm.residuals.eps_dual
            );
        }
        Ok(())
    }
}
