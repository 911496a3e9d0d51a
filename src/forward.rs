use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::error::MpcError;
use crate::model::{CostModel, DynamicsModel};
use crate::solver::{Solver, SolverState};

impl<D, C> Solver<D, C>
where
    D: DynamicsModel,
    C: CostModel,
{
    /// Roll the last policy out on the linearized dynamics, gaps included.
    pub(crate) fn linear_rollout(&self, state: &SolverState) -> (Vec<DVector<f64>>, Vec<DVector<f64>>) {
        let n = self.horizon();
        let mut dxs = Vec::with_capacity(n + 1);
        let mut dus = Vec::with_capacity(n);
        let mut dx = DVector::zeros(self.dynamics.nx());
        for k in 0..n {
            let stage = &state.stages[k];
            let du = &state.gains[k] * &dx + state.kff.column(k);
            let next = &stage.fx * &dx + &stage.fu * &du + &stage.gap;
            dxs.push(dx);
            dus.push(du);
            dx = next;
        }
        dxs.push(dx);
        (dxs, dus)
    }

    /// Closed-loop rollout of the nonlinear dynamics with step `alpha` on the feedforward.
    fn rollout(&self, state: &SolverState, alpha: f64) -> (DMatrix<f64>, DMatrix<f64>) {
        let mut xs = state.xs.clone();
        let mut us = state.us.clone();
        for k in 0..self.horizon() {
            let x = xs.column(k).into_owned();
            let dx = &x - state.xs.column(k);
            let u = state.us.column(k).into_owned()
                + state.kff.column(k).scale(alpha)
                + &state.gains[k] * dx;
            let next = self.dynamics.step(&x, &u);
            us.set_column(k, &u);
            xs.set_column(k + 1, &next);
        }
        (xs, us)
    }

    /// Cost and merit of a dynamically consistent trajectory.
    fn rollout_merit(&self, xs: &DMatrix<f64>, us: &DMatrix<f64>) -> Result<(f64, f64), MpcError> {
        let n = self.horizon();
        let nq = self.dynamics.nq();
        let kinematics = self.dynamics.kinematics();
        let (mut cost, mut violation) = (0.0, 0.0);
        for k in 0..=n {
            let x = xs.column(k).into_owned();
            let u = (k < n).then(|| us.column(k).into_owned());
            cost += self.cost.value(k, &x, u.as_ref());
            let rows = &self.layout[k];
            if rows.nc() > 0 {
                let con = self.constraints[k].evaluate(kinematics, nq, &x, u.as_ref(), rows.kind)?;
                violation += rows.violation(&con.g);
            }
        }
        Ok((cost, self.merit(cost, violation)))
    }

    /// Backtracking line search on the merit function, then co-state update.
    ///
    /// Accepts the first step with sufficient decrease. If none qualifies the
    /// smallest finite trial is taken.
    pub(crate) fn line_search(&self, state: &mut SolverState) -> Result<(), MpcError> {
        let s = &self.settings;
        let mut alpha = 1.0;
        let mut chosen = None;
        let mut accepted = false;
        while alpha >= s.ls_min_step {
            let (xs, us) = self.rollout(state, alpha);
            let (cost, merit) = self.rollout_merit(&xs, &us)?;
            if merit.is_finite() {
                let expected = (alpha * state.dv[0] + alpha * alpha * state.dv[1]).min(0.0);
                accepted = merit <= state.merit + s.ls_armijo * expected;
                chosen = Some((alpha, xs, us, cost, merit));
                if accepted {
                    break;
                }
            }
            alpha *= s.ls_step_factor;
        }

        let Some((alpha, xs, us, cost, merit)) = chosen else {
            warn!("line search: every trial diverged, keeping trajectory");
            state.step_length = 0.0;
            return Ok(());
        };
        if !accepted {
            debug!("line search exhausted, taking step {alpha:e}");
        }

        // lambda_k = V_x + V_xx (x_new - x_old)
        for k in 0..=self.horizon() {
            let dx = xs.column(k) - state.xs.column(k);
            let lam = state.vx.column(k) + &state.vxx[k] * dx;
            state.lag_mul.set_column(k, &lam);
        }

        state.xs = xs;
        state.us = us;
        state.cost = cost;
        state.merit = merit;
        state.step_length = alpha;
        Ok(())
    }
}
