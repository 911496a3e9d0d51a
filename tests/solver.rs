use approx::assert_relative_eq;
use clqr_mpc::models::{LinearDynamics, QuadraticCost, riccati_terminal};
use clqr_mpc::{ConstraintModel, MpcError, Solver, SolverSettings, shift_trajectory};
use nalgebra::{DMatrix, DVector};

const NH: usize = 8;
const DT: f64 = 0.1;

fn a() -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 2, &[1.0, DT, 0.0, 1.0])
}

fn b() -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 1, &[0.5 * DT * DT, DT])
}

fn q() -> DMatrix<f64> {
    DMatrix::identity(2, 2)
}

fn r() -> DMatrix<f64> {
    DMatrix::from_element(1, 1, 0.1)
}

fn double_integrator(
    constraints: Vec<ConstraintModel>,
    settings: SolverSettings,
) -> Solver<LinearDynamics, QuadraticCost> {
    let p = riccati_terminal(&a(), &b(), &q(), &r()).unwrap();
    let cost = QuadraticCost::new(NH, q(), r(), p);
    let dynamics = LinearDynamics::new(a(), b()).unwrap();
    Solver::new(NH, dynamics, cost, constraints, settings).unwrap()
}

fn unconstrained() -> Vec<ConstraintModel> {
    vec![ConstraintModel::Composite(vec![]); NH + 1]
}

fn guess(x0: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
    let mut xs = DMatrix::zeros(2, NH + 1);
    xs.set_column(0, x0);
    (xs, DMatrix::zeros(1, NH))
}

#[test]
fn unconstrained_lq_is_solved_in_one_iteration() {
    let solver = double_integrator(unconstrained(), SolverSettings::default());
    let mut state = solver.init_state();
    let x0 = DVector::from_vec(vec![1.0, -0.5]);
    let (xs, us) = guess(&x0);

    assert!(solver.solve(&mut state, &xs, &us, 10, false).unwrap());
    assert_eq!(state.iter(), 1);
    assert!(state.kkt() < solver.settings().termination_tol);
    assert_eq!(state.step_length(), 1.0);

    // The terminal cost is the infinite-horizon value, so u0 = -K_inf x0
    let p = riccati_terminal(&a(), &b(), &q(), &r()).unwrap();
    let bt = b().transpose();
    let k_inf = (r() + &bt * &p * b()).try_inverse().unwrap() * &bt * &p * a();
    let u0 = -(&k_inf * &x0);
    assert_relative_eq!(state.u_at(0)[0], u0[0], epsilon = 1e-8);
    assert_relative_eq!(state.gain(0), &(-k_inf), epsilon = 1e-8);
}

#[test]
fn shifted_solution_matches_previous_tail() {
    let solver = double_integrator(unconstrained(), SolverSettings::default());
    let mut state = solver.init_state();
    let x0 = DVector::from_vec(vec![2.0, 0.0]);
    let (xs, us) = guess(&x0);
    solver.solve(&mut state, &xs, &us, 10, false).unwrap();
    let previous = state.xs().clone();

    let x1 = state.x_at(1);
    let (xs, us) = shift_trajectory(state.xs(), state.us(), &x1);
    state.shift_admm();
    assert!(solver.solve(&mut state, &xs, &us, 10, true).unwrap());

    for k in 0..NH {
        assert_relative_eq!(
            state.xs().column(k),
            previous.column(k + 1),
            epsilon = 1e-8
        );
    }
}

#[test]
fn box_constrained_controls_stay_in_bounds() {
    let bound = 0.5;
    let control_box = ConstraintModel::ControlBox {
        lb: DVector::from_element(1, -bound),
        ub: DVector::from_element(1, bound),
    };
    let solver = double_integrator(vec![control_box; NH + 1], SolverSettings::default());
    let mut state = solver.init_state();
    let x0 = DVector::from_vec(vec![5.0, 0.0]);
    let (xs, us) = guess(&x0);

    let converged = solver.solve(&mut state, &xs, &us, 50, false).unwrap();
    for u in state.us().iter() {
        assert!(u.abs() <= bound + 1e-2, "control {u} outside the box");
    }
    // the unconstrained optimum pushes hard towards the origin
    assert!(state.u_at(0)[0] < -0.9 * bound);
    if converged {
        assert!(state.admm().converged);
        assert!(state.kkt() < solver.settings().termination_tol);
    }
}

#[test]
fn both_variants_solve_the_box_problem_alike() {
    let control_box = ConstraintModel::ControlBox {
        lb: DVector::from_element(1, -0.5),
        ub: DVector::from_element(1, 0.5),
    };
    let x0 = DVector::from_vec(vec![5.0, 0.0]);
    let (xs, us) = guess(&x0);
    let mut first = Vec::new();
    for variant in [clqr_mpc::AdmmVariant::Sparse, clqr_mpc::AdmmVariant::Boyd] {
        let settings = SolverSettings {
            variant,
            ..Default::default()
        };
        let solver = double_integrator(vec![control_box.clone(); NH + 1], settings);
        let mut state = solver.init_state();
        solver.solve(&mut state, &xs, &us, 3, false).unwrap();
        assert_eq!(state.variant(), variant);
        first.push(state.us().clone());
    }
    assert_relative_eq!(first[0], first[1], epsilon = 1e-9);
}

#[test]
fn zero_budget_keeps_the_guess() {
    let solver = double_integrator(unconstrained(), SolverSettings::default());
    let mut state = solver.init_state();
    let (xs, us) = guess(&DVector::from_vec(vec![1.0, 0.0]));

    assert!(!solver.solve(&mut state, &xs, &us, 0, false).unwrap());
    assert_eq!(state.iter(), 0);
    assert_eq!(state.xs(), &xs);
    assert_eq!(state.us(), &us);
    // the guess is dynamically inconsistent
    assert!(state.kkt() >= 1.0);
}

#[test]
fn failed_backward_pass_keeps_the_trajectory() {
    let settings = SolverSettings {
        reg_max: 1.0,
        ..Default::default()
    };
    let dynamics = LinearDynamics::new(a(), b()).unwrap();
    let cost = QuadraticCost::new(NH, q(), DMatrix::from_element(1, 1, -50.0), q());
    let solver = Solver::new(NH, dynamics, cost, unconstrained(), settings).unwrap();
    let mut state = solver.init_state();
    let (xs, us) = guess(&DVector::from_vec(vec![1.0, 0.0]));

    assert!(!solver.solve(&mut state, &xs, &us, 5, false).unwrap());
    assert_eq!(state.iter(), 0);
    assert_eq!(state.xs(), &xs);
}

#[test]
fn mismatched_guess_is_rejected() {
    let solver = double_integrator(unconstrained(), SolverSettings::default());
    let mut state = solver.init_state();
    let xs = DMatrix::zeros(3, NH + 1);
    let us = DMatrix::zeros(1, NH);
    let err = solver.solve(&mut state, &xs, &us, 1, false).unwrap_err();
    assert!(matches!(
        err,
        MpcError::DimensionMismatch {
            expected: 2,
            actual: 3,
            ..
        }
    ));
}

#[test]
fn construction_validates_constraints() {
    let dynamics = || LinearDynamics::new(a(), b()).unwrap();
    let cost = || QuadraticCost::new(NH, q(), r(), q());

    let crossed = ConstraintModel::ControlBox {
        lb: DVector::from_element(1, 1.0),
        ub: DVector::from_element(1, -1.0),
    };
    let mut models = unconstrained();
    models[3] = crossed;
    let err = Solver::new(NH, dynamics(), cost(), models, SolverSettings::default()).unwrap_err();
    assert!(matches!(
        err,
        MpcError::InfeasibleBounds {
            stage: 3,
            row: 0,
            ..
        }
    ));

    let short = vec![ConstraintModel::Unconstrained; NH];
    let err = Solver::new(NH, dynamics(), cost(), short, SolverSettings::default()).unwrap_err();
    assert!(matches!(err, MpcError::HorizonMismatch { .. }));

    let halfspace = ConstraintModel::FrameHalfspace {
        normal: nalgebra::Vector3::z(),
        offset: 0.0,
    };
    let models = vec![halfspace; NH + 1];
    let err = Solver::new(NH, dynamics(), cost(), models, SolverSettings::default()).unwrap_err();
    assert!(matches!(err, MpcError::MissingKinematics));

    let settings = SolverSettings {
        rho_min: 0.0,
        ..Default::default()
    };
    let err = Solver::new(NH, dynamics(), cost(), unconstrained(), settings).unwrap_err();
    assert!(matches!(err, MpcError::Config(_)));
}
