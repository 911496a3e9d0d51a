//! Constrained DDP solver: Gauss-Newton backward pass, ADMM consensus on the
//! constraint rows and a merit line search, iterated SQP-style.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::admm::{AdmmState, inf_norm};
use crate::config::ConfigError;
use crate::constraint::{ConstraintData, ConstraintModel, StageKind, StageLayout};
use crate::error::MpcError;
use crate::model::{CostData, CostModel, DynamicsModel};
use crate::rho::{AdmmVariant, PenaltyAdaptation, PenaltyLimits, penalty_policy};

// Default settings
const DEFAULT_MAX_ITER: usize = 100;
const DEFAULT_TERMINATION_TOL: f64 = 1e-4;
const DEFAULT_ADMM_MAX_ITER: usize = 1000;
const DEFAULT_EPS_ABS: f64 = 1e-4;
const DEFAULT_EPS_REL: f64 = 1e-4;
const DEFAULT_RHO: f64 = 1e-1;
const DEFAULT_RHO_MIN: f64 = 1e-6;
const DEFAULT_RHO_MAX: f64 = 1e6;
const DEFAULT_EQUALITY_RHO_SCALE: f64 = 1e3;
const DEFAULT_ADAPTIVE_RHO_TOLERANCE: f64 = 5.0;
const DEFAULT_RHO_UPDATE_INTERVAL: usize = 25;
const DEFAULT_RELAXATION: f64 = 1.6;
const DEFAULT_ADMM_WARM_START: bool = true;
const DEFAULT_REG_INIT: f64 = 0.0;
const DEFAULT_REG_MIN: f64 = 1e-9;
const DEFAULT_REG_MAX: f64 = 1e6;
const DEFAULT_REG_FACTOR: f64 = 10.0;
const DEFAULT_LS_STEP_FACTOR: f64 = 0.5;
const DEFAULT_LS_MIN_STEP: f64 = 1.0 / 1024.0;
const DEFAULT_LS_ARMIJO: f64 = 1e-4;
const DEFAULT_MERIT_PENALTY: f64 = 10.0;

/// Solver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Outer (SQP) iteration budget used by [`Solver::solve_default`].
    pub max_iter: usize,
    /// Stationarity (KKT) tolerance.
    pub termination_tol: f64,
    pub variant: AdmmVariant,
    pub admm_max_iter: usize,
    pub eps_abs: f64,
    pub eps_rel: f64,
    /// Initial penalty.
    pub rho: f64,
    pub rho_min: f64,
    pub rho_max: f64,
    /// Penalty multiplier of rows with `lb == ub`.
    pub equality_rho_scale: f64,
    /// Hysteresis band `tau`: the penalty is rescaled only outside `[1/tau, tau]`.
    pub adaptive_rho_tolerance: f64,
    pub rho_update_interval: usize,
    /// Over-relaxation `alpha` of the primal before projection.
    pub relaxation: f64,
    /// Keep consensus, duals and penalty between outer iterations.
    pub admm_warm_start: bool,
    pub reg_init: f64,
    pub reg_min: f64,
    pub reg_max: f64,
    pub reg_factor: f64,
    pub ls_step_factor: f64,
    pub ls_min_step: f64,
    pub ls_armijo: f64,
    /// Weight of constraint violation and dynamic gaps in the merit function.
    pub merit_penalty: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iter: DEFAULT_MAX_ITER,
            termination_tol: DEFAULT_TERMINATION_TOL,
            variant: AdmmVariant::default(),
            admm_max_iter: DEFAULT_ADMM_MAX_ITER,
            eps_abs: DEFAULT_EPS_ABS,
            eps_rel: DEFAULT_EPS_REL,
            rho: DEFAULT_RHO,
            rho_min: DEFAULT_RHO_MIN,
            rho_max: DEFAULT_RHO_MAX,
            equality_rho_scale: DEFAULT_EQUALITY_RHO_SCALE,
            adaptive_rho_tolerance: DEFAULT_ADAPTIVE_RHO_TOLERANCE,
            rho_update_interval: DEFAULT_RHO_UPDATE_INTERVAL,
            relaxation: DEFAULT_RELAXATION,
            admm_warm_start: DEFAULT_ADMM_WARM_START,
            reg_init: DEFAULT_REG_INIT,
            reg_min: DEFAULT_REG_MIN,
            reg_max: DEFAULT_REG_MAX,
            reg_factor: DEFAULT_REG_FACTOR,
            ls_step_factor: DEFAULT_LS_STEP_FACTOR,
            ls_min_step: DEFAULT_LS_MIN_STEP,
            ls_armijo: DEFAULT_LS_ARMIJO,
            merit_penalty: DEFAULT_MERIT_PENALTY,
        }
    }
}

impl SolverSettings {
    pub fn penalty_limits(&self) -> PenaltyLimits {
        PenaltyLimits {
            rho_min: self.rho_min,
            rho_max: self.rho_max,
            equality_scale: self.equality_rho_scale,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));
        if !(self.termination_tol > 0.0) {
            return fail("termination_tol must be positive");
        }
        if self.admm_max_iter == 0 || self.rho_update_interval == 0 {
            return fail("admm_max_iter and rho_update_interval must be at least 1");
        }
        if !(self.eps_abs >= 0.0 && self.eps_rel >= 0.0) || self.eps_abs + self.eps_rel == 0.0 {
            return fail("ADMM tolerances must be non-negative and not both zero");
        }
        if !(self.rho_min > 0.0 && self.rho_min <= self.rho && self.rho <= self.rho_max) {
            return fail("rho must satisfy 0 < rho_min <= rho <= rho_max");
        }
        if !(self.equality_rho_scale > 0.0) || !(self.adaptive_rho_tolerance > 1.0) {
            return fail("equality_rho_scale must be positive and adaptive_rho_tolerance > 1");
        }
        if !(self.relaxation > 0.0 && self.relaxation < 2.0) {
            return fail("relaxation must lie in (0, 2)");
        }
        if !(self.reg_min > 0.0
            && self.reg_min <= self.reg_max
            && self.reg_init >= 0.0
            && self.reg_init <= self.reg_max
            && self.reg_factor > 1.0)
        {
            return fail("regularization must satisfy 0 < reg_min <= reg_max, reg_init <= reg_max, reg_factor > 1");
        }
        if !(self.ls_step_factor > 0.0 && self.ls_step_factor < 1.0)
            || !(self.ls_min_step > 0.0 && self.ls_min_step <= 1.0)
            || !(self.ls_armijo >= 0.0 && self.ls_armijo < 1.0)
        {
            return fail("line search parameters out of range");
        }
        if !(self.merit_penalty >= 0.0) {
            return fail("merit_penalty must be non-negative");
        }
        Ok(())
    }
}

/// Linearization of one knot point. The terminal knot carries empty dynamics blocks.
#[derive(Debug, Clone)]
pub struct StageData {
    pub fx: DMatrix<f64>,
    pub fu: DMatrix<f64>,
    /// `f(x_k, u_k) - x_{k+1}`.
    pub gap: DVector<f64>,
    pub cost: CostData,
    pub con: ConstraintData,
}

/// Everything the solver mutates, owned by the caller and carried across solves.
#[derive(Debug)]
pub struct SolverState {
    pub(crate) xs: DMatrix<f64>, // nx * (N+1)
    pub(crate) us: DMatrix<f64>, // nu * N
    pub(crate) gains: Vec<DMatrix<f64>>,
    pub(crate) kff: DMatrix<f64>, // nu * N
    pub(crate) vx: DMatrix<f64>,  // nx * (N+1)
    pub(crate) vxx: Vec<DMatrix<f64>>,
    /// Co-states.
    pub(crate) lag_mul: DMatrix<f64>, // nx * (N+1)
    pub(crate) stages: Vec<StageData>,
    pub(crate) admm: AdmmState,
    pub(crate) penalty: Box<dyn PenaltyAdaptation>,
    pub(crate) reset_penalty: bool,
    pub(crate) reg: f64,
    /// Expected change `alpha * dv[0] + alpha^2 * dv[1]` of the last backward pass.
    pub(crate) dv: [f64; 2],
    pub(crate) cost: f64,
    pub(crate) merit: f64,
    pub(crate) kkt: f64,
    pub(crate) iter: usize,
    pub(crate) step_length: f64,
    pub(crate) converged: bool,
}

impl SolverState {
    pub fn horizon(&self) -> usize {
        self.us.ncols()
    }

    pub fn xs(&self) -> &DMatrix<f64> {
        &self.xs
    }

    pub fn us(&self) -> &DMatrix<f64> {
        &self.us
    }

    pub fn x_at(&self, k: usize) -> DVector<f64> {
        self.xs.column(k).into_owned()
    }

    pub fn u_at(&self, k: usize) -> DVector<f64> {
        self.us.column(k).into_owned()
    }

    /// Feedback gain `K_k` (nu x nx).
    pub fn gain(&self, k: usize) -> &DMatrix<f64> {
        &self.gains[k]
    }

    pub fn feedforward(&self, k: usize) -> DVector<f64> {
        self.kff.column(k).into_owned()
    }

    /// Outer iterations performed by the last solve.
    pub fn iter(&self) -> usize {
        self.iter
    }

    /// Stationarity residual at the returned trajectory.
    pub fn kkt(&self) -> f64 {
        self.kkt
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn merit(&self) -> f64 {
        self.merit
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn step_length(&self) -> f64 {
        self.step_length
    }

    pub fn regularization(&self) -> f64 {
        self.reg
    }

    pub fn admm(&self) -> &AdmmState {
        &self.admm
    }

    pub fn variant(&self) -> AdmmVariant {
        self.penalty.variant()
    }

    /// Current per-row penalties of every knot point.
    pub fn penalties(&self) -> Vec<DVector<f64>> {
        self.penalty.penalties()
    }

    /// Shift consensus and duals one knot point forward, alongside the trajectory.
    pub fn shift_admm(&mut self) {
        self.admm.shift();
    }

    /// Drop consensus, duals and penalty; they are rebuilt at the next ADMM call.
    pub fn reset_admm(&mut self) {
        self.admm.reset();
        self.reset_penalty = true;
    }
}

/// Constrained DDP solver over a fixed horizon.
#[derive(Debug)]
pub struct Solver<D, C> {
    pub(crate) dynamics: D,
    pub(crate) cost: C,
    pub(crate) constraints: Vec<ConstraintModel>,
    pub(crate) layout: Vec<StageLayout>,
    pub(crate) settings: SolverSettings,
    horizon: usize,
}

impl<D, C> Solver<D, C>
where
    D: DynamicsModel,
    C: CostModel,
{
    /// Build a solver over `horizon` intervals with one constraint model per knot point.
    ///
    /// Bounds are validated here; `lb > ub` is fatal.
    pub fn new(
        horizon: usize,
        dynamics: D,
        cost: C,
        constraints: Vec<ConstraintModel>,
        settings: SolverSettings,
    ) -> Result<Self, MpcError> {
        settings.validate()?;
        if horizon == 0 || constraints.len() != horizon + 1 {
            return Err(MpcError::HorizonMismatch {
                horizon,
                expected: horizon + 1,
                actual: constraints.len(),
            });
        }
        let (nx, nu) = (dynamics.nx(), dynamics.nu());
        for (k, model) in constraints.iter().enumerate() {
            model.validate(k, nx, nu)?;
            if model.needs_kinematics() && dynamics.kinematics().is_none() {
                return Err(MpcError::MissingKinematics);
            }
        }
        let layout: Vec<StageLayout> = constraints
            .iter()
            .enumerate()
            .map(|(k, m)| StageLayout::new(m, nx, nu, StageKind::of(k, horizon)))
            .collect();

        debug!("nx = {nx}, nu = {nu}, N = {horizon}");
        debug!(
            "constraint rows per stage = {:?}",
            layout.iter().map(StageLayout::nc).collect::<Vec<_>>()
        );
        debug!("settings = {settings:?}");

        Ok(Self {
            dynamics,
            cost,
            constraints,
            layout,
            settings,
            horizon,
        })
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn dynamics(&self) -> &D {
        &self.dynamics
    }

    pub fn cost(&self) -> &C {
        &self.cost
    }

    /// Cost model, for reference and weight updates between solves.
    pub fn cost_mut(&mut self) -> &mut C {
        &mut self.cost
    }

    pub fn layout(&self) -> &[StageLayout] {
        &self.layout
    }

    /// Fresh state with a zero trajectory and initial penalties.
    pub fn init_state(&self) -> SolverState {
        let (nx, nu, n) = (self.dynamics.nx(), self.dynamics.nu(), self.horizon);
        let mut penalty = penalty_policy(self.settings.variant, self.settings.penalty_limits());
        penalty.reset(&self.layout, self.settings.rho);
        SolverState {
            xs: DMatrix::zeros(nx, n + 1),
            us: DMatrix::zeros(nu, n),
            gains: vec![DMatrix::zeros(nu, nx); n],
            kff: DMatrix::zeros(nu, n),
            vx: DMatrix::zeros(nx, n + 1),
            vxx: vec![DMatrix::zeros(nx, nx); n + 1],
            lag_mul: DMatrix::zeros(nx, n + 1),
            stages: Vec::with_capacity(n + 1),
            admm: AdmmState::new(&self.layout),
            penalty,
            reset_penalty: false,
            reg: self.settings.reg_init,
            dv: [0.0; 2],
            cost: 0.0,
            merit: 0.0,
            kkt: f64::INFINITY,
            iter: 0,
            step_length: 0.0,
            converged: false,
        }
    }

    /// [`Solver::solve`] with the configured iteration budget and no ADMM warm start.
    pub fn solve_default(
        &self,
        state: &mut SolverState,
        xs: &DMatrix<f64>,
        us: &DMatrix<f64>,
    ) -> Result<bool, MpcError> {
        self.solve(state, xs, us, self.settings.max_iter, false)
    }

    /// Solve from the guess `(xs, us)`; `xs` column 0 is the initial state.
    ///
    /// `warm_start` keeps the ADMM consensus, duals and penalty of `state`.
    /// Returns `Ok(false)` when the budget runs out before convergence; the
    /// trajectory in `state` is still the best one found.
    pub fn solve(
        &self,
        state: &mut SolverState,
        xs: &DMatrix<f64>,
        us: &DMatrix<f64>,
        max_iter: usize,
        warm_start: bool,
    ) -> Result<bool, MpcError> {
        self.check_guess(xs, us)?;
        state.xs.copy_from(xs);
        state.us.copy_from(us);
        if !warm_start {
            state.reset_admm();
        }
        state.lag_mul.fill(0.0);
        state.iter = 0;
        state.converged = false;
        state.step_length = 0.0;

        loop {
            self.linearize(state)?;
            state.kkt = self.kkt(state);
            debug!(
                "iter {}: cost = {:.6e}, merit = {:.6e}, KKT = {:.3e}",
                state.iter, state.cost, state.merit, state.kkt
            );
            if state.iter > 0 && state.admm.converged && state.kkt < self.settings.termination_tol {
                state.converged = true;
                debug!("Solver converged in {} iterations", state.iter);
                break;
            }
            if state.iter >= max_iter {
                break;
            }
            match self.admm_solve(state) {
                Ok(()) => {}
                Err(MpcError::BackwardPassFailed {
                    stage,
                    regularization,
                }) => {
                    warn!(
                        "backward pass failed at stage {stage} (reg = {regularization:e}), keeping trajectory"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
            self.line_search(state)?;
            state.iter += 1;
        }
        Ok(state.converged)
    }

    fn check_guess(&self, xs: &DMatrix<f64>, us: &DMatrix<f64>) -> Result<(), MpcError> {
        let (nx, nu, n) = (self.dynamics.nx(), self.dynamics.nu(), self.horizon);
        let checks = [
            ("state guess rows", nx, xs.nrows()),
            ("state guess columns", n + 1, xs.ncols()),
            ("control guess rows", nu, us.nrows()),
            ("control guess columns", n, us.ncols()),
        ];
        for (what, expected, actual) in checks {
            if expected != actual {
                return Err(MpcError::DimensionMismatch {
                    what,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Linearize dynamics, cost and constraints along the current trajectory,
    /// and refresh cost and merit.
    pub(crate) fn linearize(&self, state: &mut SolverState) -> Result<(), MpcError> {
        let n = self.horizon;
        let nq = self.dynamics.nq();
        let kinematics = self.dynamics.kinematics();
        let mut stages = Vec::with_capacity(n + 1);
        let (mut cost, mut violation, mut gaps) = (0.0, 0.0, 0.0);

        for k in 0..=n {
            let x = state.xs.column(k).into_owned();
            let kind = self.layout[k].kind;
            let stage = if k < n {
                let u = state.us.column(k).into_owned();
                let (fx, fu) = self.dynamics.linearize(&x, &u);
                let gap = self.dynamics.step(&x, &u) - state.xs.column(k + 1);
                StageData {
                    fx,
                    fu,
                    gap,
                    cost: self.cost.evaluate(k, &x, Some(&u)),
                    con: self.constraints[k].evaluate(kinematics, nq, &x, Some(&u), kind)?,
                }
            } else {
                StageData {
                    fx: DMatrix::zeros(0, 0),
                    fu: DMatrix::zeros(0, 0),
                    gap: DVector::zeros(0),
                    cost: self.cost.evaluate(k, &x, None),
                    con: self.constraints[k].evaluate(kinematics, nq, &x, None, kind)?,
                }
            };
            cost += stage.cost.value;
            violation += self.layout[k].violation(&stage.con.g);
            gaps += stage.gap.lp_norm(1);
            stages.push(stage);
        }

        state.stages = stages;
        state.cost = cost;
        state.merit = self.merit(cost, violation + gaps);
        Ok(())
    }

    pub(crate) fn merit(&self, cost: f64, infeasibility: f64) -> f64 {
        cost + self.settings.merit_penalty * infeasibility
    }

    /// Stationarity of the Lagrangian, dynamic gaps and constraint violation,
    /// in the max norm.
    pub(crate) fn kkt(&self, state: &SolverState) -> f64 {
        let n = self.horizon;
        let y = &state.admm.y;
        let mut kkt: f64 = 0.0;

        for (k, stage) in state.stages.iter().enumerate().take(n) {
            let lam_next = state.lag_mul.column(k + 1).into_owned();
            let mut lu = &stage.cost.lu + stage.fu.tr_mul(&lam_next);
            if stage.con.nc() > 0 {
                lu += stage.con.ju.tr_mul(&y[k]);
            }
            kkt = kkt.max(inf_norm(&lu));

            if k > 0 {
                let mut lx = &stage.cost.lx + stage.fx.tr_mul(&lam_next)
                    - state.lag_mul.column(k).into_owned();
                if stage.con.nc() > 0 {
                    lx += stage.con.jx.tr_mul(&y[k]);
                }
                kkt = kkt.max(inf_norm(&lx));
            }
            kkt = kkt
                .max(inf_norm(&stage.gap))
                .max(self.layout[k].max_violation(&stage.con.g));
        }

        let terminal = &state.stages[n];
        let mut lx = &terminal.cost.lx - state.lag_mul.column(n).into_owned();
        if terminal.con.nc() > 0 {
            lx += terminal.con.jx.tr_mul(&y[n]);
        }
        kkt.max(inf_norm(&lx))
            .max(self.layout[n].max_violation(&terminal.con.g))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        assert!(SolverSettings::default().validate().is_ok());
    }

    #[test]
    fn settings_reject_bad_penalty_range() {
        let settings = SolverSettings {
            rho: 1e7,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let settings = SolverSettings {
            relaxation: 2.0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: SolverSettings = toml::from_str("variant = \"boyd\"\neps_abs = 1e-6").unwrap();
        assert_eq!(settings.variant, AdmmVariant::Boyd);
        assert_eq!(settings.eps_abs, 1e-6);
        assert_eq!(settings.admm_max_iter, DEFAULT_ADMM_MAX_ITER);
    }
}
