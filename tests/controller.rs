use approx::assert_relative_eq;
use clqr_mpc::models::{SerialArm, SerialChain, TrackingCost};
use clqr_mpc::{
    ActuatorChannel, ActuatorInterface, CircleReference, ConstraintModel, ControllerConfig,
    CostTerm, DeadlinePolicy, DynamicsModel, MpcController, MpcError, SensorChannel,
    SensorInterface, Solver, SolverSettings, TaskPhase,
};
use nalgebra::DVector;

const NQ: usize = 7;

/// Arm integrated at the control rate.
struct SimRobot {
    arm: SerialArm,
    x: DVector<f64>,
}

impl SimRobot {
    fn new(dt_ctrl: f64) -> Self {
        let mut x = DVector::zeros(2 * NQ);
        x.rows_mut(0, NQ)
            .copy_from(&DVector::from_vec(vec![0.1, 0.7, 0.0, -1.0, 0.0, 0.5, 0.0]));
        Self {
            arm: SerialArm::iiwa(dt_ctrl).unwrap(),
            x,
        }
    }

    fn q(&self) -> DVector<f64> {
        self.x.rows(0, NQ).into_owned()
    }

    fn apply(&mut self, tau: &DVector<f64>) {
        self.x = self.arm.step(&self.x, tau);
    }
}

impl SensorInterface for SimRobot {
    fn read(&mut self, channel: SensorChannel) -> Result<DVector<f64>, MpcError> {
        match channel {
            SensorChannel::JointPositions => Ok(self.q()),
            SensorChannel::JointVelocities => Ok(self.x.rows(NQ, NQ).into_owned()),
            other => Err(MpcError::Sensor(other)),
        }
    }
}

#[derive(Default)]
struct Recorder {
    commands: Vec<DVector<f64>>,
}

impl ActuatorInterface for Recorder {
    fn write(&mut self, _channel: ActuatorChannel, value: &DVector<f64>) -> Result<(), MpcError> {
        self.commands.push(value.clone());
        Ok(())
    }
}

/// Positions only; velocities are unavailable.
struct BrokenSensor;

impl SensorInterface for BrokenSensor {
    fn read(&mut self, channel: SensorChannel) -> Result<DVector<f64>, MpcError> {
        match channel {
            SensorChannel::JointPositions => Ok(DVector::zeros(NQ)),
            other => Err(MpcError::Sensor(other)),
        }
    }
}

fn config() -> ControllerConfig {
    ControllerConfig {
        horizon: 5,
        dt: 0.01,
        ctrl_freq: 1000.0,
        warmup_max_iter: 10,
        t_track: 0.003,
        t_total: 1.0,
        solver: SolverSettings {
            admm_max_iter: 20,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn controller(
    config: ControllerConfig,
    robot: &SimRobot,
) -> Result<MpcController<SerialArm, TrackingCost<SerialChain>>, MpcError> {
    let arm = SerialArm::iiwa(config.dt)?;
    let u_grav = arm.gravity_torque(&robot.q());
    let n = config.horizon;
    let cost = TrackingCost::new(arm.chain().clone(), NQ, NQ, NQ, n)
        .with_term(CostTerm::StateRegularization, 1e-2, &robot.x)?
        .with_term(CostTerm::ControlRegularization, 1e-4, &u_grav)?;
    let constraints = vec![ConstraintModel::Unconstrained; n + 1];
    let solver = Solver::new(n, arm, cost, constraints, config.solver.clone())?;
    MpcController::new(solver, config)
}

#[test]
fn tracking_starts_once_and_follows_the_circle() {
    let config = config();
    let mut robot = SimRobot::new(config.dt_ctrl());
    let mut mpc = controller(config.clone(), &robot).unwrap();
    assert!(!mpc.solver().cost().is_active(CostTerm::FrameTranslation));

    mpc.warmup(&mut robot).unwrap();
    let mut actuators = Recorder::default();
    let phases: Vec<TaskPhase> = (0..25)
        .map(|_| {
            let report = mpc.run_cycle(&mut robot, &mut actuators).unwrap();
            robot.apply(&report.command);
            report.phase
        })
        .collect();

    assert!(phases[..3].iter().all(|p| *p == TaskPhase::Reach));
    assert!(phases[3..].iter().all(|p| *p == TaskPhase::Track));
    assert_eq!(mpc.phase(), TaskPhase::Track);
    assert_eq!(mpc.cycle(), 25);

    // last refresh at cycle 23, i.e. 20 cycles into the tracking phase
    let circle = CircleReference::from_config(&config);
    let cost = mpc.solver().cost();
    assert!(cost.is_active(CostTerm::FrameTranslation));
    for (k, target) in mpc.targets().iter().enumerate() {
        assert_relative_eq!(*target, circle.sample(20 + 10 * k), epsilon = 1e-12);
        assert_eq!(cost.weight(CostTerm::FrameTranslation, k), config.tracking_weight);
        assert_eq!(
            cost.reference(CostTerm::FrameTranslation, k),
            &DVector::from_column_slice(target.as_slice())
        );
    }
    assert_eq!(actuators.commands.len(), 25);
}

#[test]
fn simulation_commands_the_raw_torque() {
    let config = config();
    let mut robot = SimRobot::new(config.dt_ctrl());
    let mut mpc = controller(config.clone(), &robot).unwrap();
    let mut actuators = Recorder::default();

    let report = mpc.run_cycle(&mut robot, &mut actuators).unwrap();
    assert_eq!(report.command, report.u0);
    assert_eq!(report.gain.shape(), (NQ, 2 * NQ));
    assert_eq!(report.x_des.len(), 2 * NQ);
    assert!(report.u0.iter().all(|u| u.is_finite()));
}

#[test]
fn hardware_subtracts_gravity_from_the_command() {
    let config = ControllerConfig {
        run_sim: false,
        ..config()
    };
    let mut robot = SimRobot::new(config.dt_ctrl());
    let mut mpc = controller(config.clone(), &robot).unwrap();
    let mut actuators = Recorder::default();

    let q = robot.q();
    let report = mpc.run_cycle(&mut robot, &mut actuators).unwrap();
    let gravity = mpc.solver().dynamics().gravity_torque(&q);
    assert_relative_eq!(report.command, &report.u0 - gravity, epsilon = 1e-12);
    assert_eq!(actuators.commands[0], report.command);
}

#[test]
fn overrun_holds_the_previous_command() {
    let config = ControllerConfig {
        deadline: DeadlinePolicy::HoldPrevious,
        cycle_budget: Some(1e-12),
        ..config()
    };
    let mut robot = SimRobot::new(config.dt_ctrl());
    let mut mpc = controller(config.clone(), &robot).unwrap();
    let mut actuators = Recorder::default();

    let first = mpc.run_cycle(&mut robot, &mut actuators).unwrap();
    assert!(first.overrun);
    assert_eq!(first.command, first.u0);

    robot.apply(&first.command);
    let second = mpc.run_cycle(&mut robot, &mut actuators).unwrap();
    assert!(second.overrun);
    assert_eq!(second.command, first.command);
    assert_eq!(actuators.commands[1], first.command);
}

#[test]
fn best_effort_commands_late_solutions() {
    let config = ControllerConfig {
        cycle_budget: Some(1e-12),
        ..config()
    };
    let mut robot = SimRobot::new(config.dt_ctrl());
    let mut mpc = controller(config.clone(), &robot).unwrap();
    let mut actuators = Recorder::default();

    mpc.run_cycle(&mut robot, &mut actuators).unwrap();
    let second = mpc.run_cycle(&mut robot, &mut actuators).unwrap();
    assert!(second.overrun);
    assert_eq!(second.command, second.u0);
}

#[test]
fn sensor_failure_is_reported() {
    let config = config();
    let robot = SimRobot::new(config.dt_ctrl());
    let mut mpc = controller(config.clone(), &robot).unwrap();
    let mut actuators = Recorder::default();

    let err = mpc.run_cycle(&mut BrokenSensor, &mut actuators).unwrap_err();
    assert!(matches!(
        err,
        MpcError::Sensor(SensorChannel::JointVelocities)
    ));
    assert!(actuators.commands.is_empty());
    assert_eq!(mpc.cycle(), 0);
}

#[test]
fn horizon_must_match_the_solver() {
    let robot = SimRobot::new(1e-3);
    let arm = SerialArm::iiwa(0.01).unwrap();
    let cost = TrackingCost::new(arm.chain().clone(), NQ, NQ, NQ, 4)
        .with_term(CostTerm::StateRegularization, 1e-2, &robot.x)
        .unwrap();
    let solver = Solver::new(
        4,
        arm,
        cost,
        vec![ConstraintModel::Unconstrained; 5],
        SolverSettings::default(),
    )
    .unwrap();
    let err = MpcController::new(solver, config()).unwrap_err();
    assert!(matches!(
        err,
        MpcError::DimensionMismatch {
            expected: 5,
            actual: 4,
            ..
        }
    ));
}

#[test]
fn warm_up_solves_from_rest() {
    let config = config();
    let mut robot = SimRobot::new(config.dt_ctrl());
    let mut mpc = controller(config.clone(), &robot).unwrap();

    let report = mpc.warmup(&mut robot).unwrap();
    assert!(report.iter >= 1);
    assert!(report.kkt.is_finite());
    assert_eq!(mpc.cycle(), 0);
    assert_eq!(mpc.phase(), TaskPhase::Reach);
    assert_eq!(mpc.state().x_at(0), robot.x);
}
