use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::error::MpcError;
use crate::model::{CostModel, DynamicsModel};
use crate::solver::{Solver, SolverState};

/// `diag(rho) * j`
fn scale_rows(j: &DMatrix<f64>, rho: &DVector<f64>) -> DMatrix<f64> {
    let mut out = j.clone();
    for (mut row, r) in out.row_iter_mut().zip(rho.iter()) {
        row *= *r;
    }
    out
}

impl<D, C> Solver<D, C>
where
    D: DynamicsModel,
    C: CostModel,
{
    /// Riccati recursion on the augmented Lagrangian of the current ADMM iterate.
    ///
    /// Each constrained stage adds `J^T diag(rho) J` to its Hessian and
    /// `J^T (y - rho * (z - g))` to its gradient. A control Hessian that fails
    /// Cholesky is regularized and the same stage retried, up to `reg_max`.
    pub(crate) fn backward_pass(&self, state: &mut SolverState) -> Result<(), MpcError> {
        let s = &self.settings;
        let n = self.horizon();
        let nu = self.dynamics.nu();
        let mut reg = s.reg_init;
        let mut dv = [0.0; 2];

        let terminal = &state.stages[n];
        let mut vx = terminal.cost.lx.clone();
        let mut vxx = terminal.cost.lxx.clone();
        if terminal.con.nc() > 0 {
            let rho = state.penalty.stage_penalty(n);
            let w = &state.admm.y[n] - rho.component_mul(&(&state.admm.z[n] - &terminal.con.g));
            vx += terminal.con.jx.tr_mul(&w);
            vxx += terminal.con.jx.tr_mul(&scale_rows(&terminal.con.jx, &rho));
        }
        state.vx.set_column(n, &vx);
        state.vxx[n].copy_from(&vxx);

        for k in (0..n).rev() {
            let stage = &state.stages[k];
            let vx_next = &vx + &vxx * &stage.gap;
            let vxx_fx = &vxx * &stage.fx;
            let vxx_fu = &vxx * &stage.fu;

            let mut qx = &stage.cost.lx + stage.fx.tr_mul(&vx_next);
            let mut qu = &stage.cost.lu + stage.fu.tr_mul(&vx_next);
            let mut qxx = &stage.cost.lxx + stage.fx.tr_mul(&vxx_fx);
            let mut quu = &stage.cost.luu + stage.fu.tr_mul(&vxx_fu);
            let mut qux = &stage.cost.lux + stage.fu.tr_mul(&vxx_fx);

            let con = &stage.con;
            if con.nc() > 0 {
                let rho = state.penalty.stage_penalty(k);
                let w = &state.admm.y[k] - rho.component_mul(&(&state.admm.z[k] - &con.g));
                let rho_jx = scale_rows(&con.jx, &rho);
                let rho_ju = scale_rows(&con.ju, &rho);
                qx += con.jx.tr_mul(&w);
                qu += con.ju.tr_mul(&w);
                qxx += con.jx.tr_mul(&rho_jx);
                quu += con.ju.tr_mul(&rho_ju);
                qux += con.ju.tr_mul(&rho_jx);
            }

            let (gain, ff) = loop {
                let quu_reg = &quu + DMatrix::<f64>::identity(nu, nu) * reg;
                if let Some(chol) = quu_reg.cholesky() {
                    break (-chol.solve(&qux), -chol.solve(&qu));
                }
                if reg >= s.reg_max {
                    return Err(MpcError::BackwardPassFailed {
                        stage: k,
                        regularization: reg,
                    });
                }
                reg = (reg * s.reg_factor).max(s.reg_min).min(s.reg_max);
                debug!("Quu not positive definite at stage {k}, regularization raised to {reg:e}");
            };

            // Value function with the unregularized Hessian
            let quu_ff = &quu * &ff;
            vx = &qx + gain.tr_mul(&quu_ff) + gain.tr_mul(&qu) + qux.tr_mul(&ff);
            vxx = &qxx + gain.tr_mul(&(&quu * &gain)) + gain.tr_mul(&qux) + qux.tr_mul(&gain);
            vxx = (&vxx + vxx.transpose()) * 0.5;

            dv[0] += ff.dot(&qu);
            dv[1] += 0.5 * ff.dot(&quu_ff);

            state.gains[k] = gain;
            state.kff.set_column(k, &ff);
            state.vx.set_column(k, &vx);
            state.vxx[k].copy_from(&vxx);
        }

        state.reg = reg;
        state.dv = dv;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::constraint::ConstraintModel;
    use crate::models::{LinearDynamics, QuadraticCost};
    use crate::solver::SolverSettings;

    fn scalar_solver(r: f64, settings: SolverSettings) -> Solver<LinearDynamics, QuadraticCost> {
        let one = DMatrix::from_element(1, 1, 1.0);
        let dynamics = LinearDynamics::new(one.clone(), one.clone()).unwrap();
        let cost = QuadraticCost::new(
            1,
            one.clone(),
            DMatrix::from_element(1, 1, r),
            one,
        );
        let free = vec![ConstraintModel::Composite(vec![]); 2];
        Solver::new(1, dynamics, cost, free, settings).unwrap()
    }

    fn linearized(solver: &Solver<LinearDynamics, QuadraticCost>) -> SolverState {
        let mut state = solver.init_state();
        state.xs = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        solver.linearize(&mut state).unwrap();
        state
    }

    #[test]
    fn one_stage_riccati_gain() {
        // Q = R = P = 1, A = B = 1: K = -B P A / (R + B P B) = -0.5
        let solver = scalar_solver(1.0, SolverSettings::default());
        let mut state = linearized(&solver);
        solver.backward_pass(&mut state).unwrap();
        assert_relative_eq!(state.gain(0)[(0, 0)], -0.5, epsilon = 1e-12);
        assert_eq!(state.regularization(), 0.0);
        // no gap, so V_x(0) = P_0 x0 with P_0 = Q + P - P^2 / (R + P) = 1.5
        assert_relative_eq!(state.vx[(0, 0)], 1.5, epsilon = 1e-12);
        assert!(state.dv[0] < 0.0);
    }

    #[test]
    fn regularization_recovers_indefinite_control_hessian() {
        // Quu = R + B P B = -3 + 1
        let solver = scalar_solver(-3.0, SolverSettings::default());
        let mut state = linearized(&solver);
        solver.backward_pass(&mut state).unwrap();
        assert!(state.regularization() > 2.0);
        assert!(state.gain(0)[(0, 0)].is_finite());
    }

    #[test]
    fn saturated_regularization_fails() {
        let settings = SolverSettings {
            reg_max: 1.0,
            ..Default::default()
        };
        let solver = scalar_solver(-3.0, settings);
        let mut state = linearized(&solver);
        let err = solver.backward_pass(&mut state).unwrap_err();
        assert!(matches!(
            err,
            MpcError::BackwardPassFailed { stage: 0, regularization } if regularization == 1.0
        ));
    }

    #[test]
    fn scale_rows_weights_each_row() {
        let j = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let rho = DVector::from_vec(vec![2.0, 0.5]);
        assert_eq!(
            scale_rows(&j, &rho),
            DMatrix::from_row_slice(2, 2, &[2.0, 4.0, 1.5, 2.0])
        );
    }
}
