use std::path::PathBuf;

use clqr_mpc::models::{SerialArm, TrackingCost};
use clqr_mpc::{
    ActuatorChannel, ActuatorInterface, ConfigLoader, ConstraintModel, ControllerConfig,
    CostTerm, DynamicsModel, FrameKinematics, MpcController, MpcError, SensorChannel,
    SensorInterface, Solver,
};
use log::{debug, info};
use nalgebra::{DVector, Vector3};

const NQ: usize = 7;
const MIN_JOINT_VELOCITY: f64 = -0.5;

/// Arm simulated at the control rate. Commands are joint torques; on hardware
/// the robot adds gravity compensation itself.
struct SimulatedArm {
    arm: SerialArm,
    x: DVector<f64>,
    add_gravity: bool,
    last_command: DVector<f64>,
}

impl SensorInterface for SimulatedArm {
    fn read(&mut self, channel: SensorChannel) -> Result<DVector<f64>, MpcError> {
        match channel {
            SensorChannel::JointPositions => Ok(self.x.rows(0, NQ).into_owned()),
            SensorChannel::JointVelocities => Ok(self.x.rows(NQ, NQ).into_owned()),
            SensorChannel::JointTorquesCommanded => Ok(self.last_command.clone()),
            other => Err(MpcError::Sensor(other)),
        }
    }
}

impl SimulatedArm {
    fn apply(&mut self, command: &DVector<f64>) {
        let mut tau = command.clone();
        if self.add_gravity {
            tau += self.arm.gravity_torque(&self.x.rows(0, NQ).into_owned());
        }
        self.x = self.arm.step(&self.x, &tau);
        self.last_command = command.clone();
    }
}

/// Holds the torque written in the current cycle until the simulation consumes it.
struct TorqueBus {
    command: DVector<f64>,
}

impl ActuatorInterface for TorqueBus {
    fn write(&mut self, channel: ActuatorChannel, value: &DVector<f64>) -> Result<(), MpcError> {
        if value.len() != NQ || value.iter().any(|t| !t.is_finite()) {
            return Err(MpcError::Actuator(channel));
        }
        self.command.copy_from(value);
        Ok(())
    }
}

fn main() -> Result<(), MpcError> {
    env_logger::init();
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/kuka_circle.toml"));
    let config = ControllerConfig::load(&path)?;
    info!("loaded {}", path.display());

    let q0 = DVector::from_vec(vec![0.1, 0.7, 0.0, 0.7, -0.5, 1.5, 0.0]);
    let mut x0 = DVector::zeros(2 * NQ);
    x0.rows_mut(0, NQ).copy_from(&q0);

    let arm = SerialArm::iiwa(config.dt)?;
    let u_grav = arm.gravity_torque(&q0);
    let target = DVector::from_column_slice(&config.frame_translation_ref);
    let cost = TrackingCost::new(arm.chain().clone(), NQ, NQ, NQ, config.horizon)
        .with_term(CostTerm::StateRegularization, 1e-1, &x0)?
        .with_term(CostTerm::ControlRegularization, 1e-4, &u_grav)?
        .with_term(CostTerm::FrameTranslation, 1.0, &target)?;

    // joint velocities bounded from below, torques free
    let mut lb = DVector::from_element(2 * NQ, f64::NEG_INFINITY);
    lb.rows_mut(NQ, NQ).fill(MIN_JOINT_VELOCITY);
    let stage = ConstraintModel::Composite(vec![
        ConstraintModel::Unconstrained,
        ConstraintModel::StateBox {
            lb,
            ub: DVector::from_element(2 * NQ, f64::INFINITY),
        },
    ]);
    let constraints = vec![stage; config.horizon + 1];

    let solver = Solver::new(config.horizon, arm, cost, constraints, config.solver.clone())?;
    let mut robot = SimulatedArm {
        arm: SerialArm::iiwa(config.dt_ctrl())?,
        x: x0,
        add_gravity: !config.run_sim,
        last_command: u_grav.clone(),
    };
    let mut bus = TorqueBus { command: u_grav };
    let cycles = (config.t_total * config.ctrl_freq).round() as usize;
    let mut mpc = MpcController::new(solver, config)?;

    mpc.warmup(&mut robot)?;

    let chain = mpc.solver().dynamics().chain().clone();
    let mut total_iters = 0;
    let mut overruns = 0;
    for _ in 0..cycles {
        let report = mpc.run_cycle(&mut robot, &mut bus)?;
        robot.apply(&bus.command);
        total_iters += report.iter;
        overruns += usize::from(report.overrun);

        if report.cycle % 100 == 0 {
            let p = chain.frame_translation(&robot.x.rows(0, NQ).into_owned());
            let error: Vector3<f64> = p - mpc.targets()[0];
            debug!(
                "cycle {:5} {:?}: {} iterations, KKT {:.3e}, tracking error {:.4}",
                report.cycle,
                report.phase,
                report.iter,
                report.kkt,
                error.norm()
            );
        }
    }

    info!("Total iterations: {total_iters}, deadline overruns: {overruns}");
    Ok(())
}
