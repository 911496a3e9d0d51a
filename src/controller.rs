//! Receding-horizon control loop around one persistent [`Solver`].

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, Vector3};

use crate::config::{ConfigLoader, ControllerConfig, DeadlinePolicy};
use crate::error::MpcError;
use crate::model::{CostModel, CostTerm, DynamicsModel};
use crate::solver::{Solver, SolverState};
use crate::trajectory::shift_trajectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorChannel {
    JointPositions,
    JointVelocities,
    JointAccelerations,
    JointTorquesTotal,
    JointTorquesExternal,
    JointTorquesCommanded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorChannel {
    JointTorques,
}

pub trait SensorInterface {
    fn read(&mut self, channel: SensorChannel) -> Result<DVector<f64>, MpcError>;
}

pub trait ActuatorInterface {
    fn write(&mut self, channel: ActuatorChannel, value: &DVector<f64>) -> Result<(), MpcError>;
}

/// Controller phase. `Reach` -> `Track` happens once and is never undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Reach,
    Track,
}

/// End-effector circle in the horizontal plane, sampled per control cycle.
///
/// `p(i) = c + [r (1 - cos(i dt w)), -r sin(i dt w), 0]`, held at its last
/// sample past `len`.
#[derive(Debug, Clone)]
pub struct CircleReference {
    center: Vector3<f64>,
    radius: f64,
    omega: f64,
    dt: f64,
    len: usize,
}

impl CircleReference {
    pub fn new(center: Vector3<f64>, radius: f64, omega: f64, dt: f64, len: usize) -> Self {
        Self {
            center,
            radius,
            omega,
            dt,
            len,
        }
    }

    /// Circle of `config`, long enough to cover the tracking phase plus one horizon.
    pub fn from_config(config: &ControllerConfig) -> Self {
        let ratio = config.ocp_to_ctrl_ratio();
        let len = ((config.t_total - config.t_track) / config.dt_ctrl()).round() as usize
            + config.horizon * ratio;
        Self::new(
            Vector3::from(config.frame_translation_ref),
            config.circle_radius,
            config.circle_omega,
            config.dt_ctrl(),
            len,
        )
    }

    pub fn sample(&self, i: usize) -> Vector3<f64> {
        let i = i.min(self.len.saturating_sub(1));
        let angle = i as f64 * self.dt * self.omega;
        self.center
            + Vector3::new(
                self.radius * (1.0 - angle.cos()),
                -self.radius * angle.sin(),
                0.0,
            )
    }
}

/// Outcome of one control cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: usize,
    pub phase: TaskPhase,
    /// Torque written to the actuators.
    pub command: DVector<f64>,
    /// First control of the solved trajectory.
    pub u0: DVector<f64>,
    /// Desired next state `xs[1]`.
    pub x_des: DVector<f64>,
    /// Feedback gain `K[0]`.
    pub gain: DMatrix<f64>,
    pub solve_time: Duration,
    pub iter: usize,
    pub kkt: f64,
    pub converged: bool,
    /// The solve exceeded the cycle budget.
    pub overrun: bool,
}

/// Reads the robot state, retargets the cost by task phase, re-solves from the
/// shifted previous solution and commands the first control.
#[derive(Debug)]
pub struct MpcController<D, C> {
    solver: Solver<D, C>,
    state: SolverState,
    config: ControllerConfig,
    reference: CircleReference,
    targets: Vec<Vector3<f64>>,
    phase: TaskPhase,
    cycle: usize,
    warm: bool,
    last_command: Option<DVector<f64>>,
}

impl<D, C> MpcController<D, C>
where
    D: DynamicsModel,
    C: CostModel,
{
    pub fn new(solver: Solver<D, C>, config: ControllerConfig) -> Result<Self, MpcError> {
        config.validate()?;
        if solver.horizon() != config.horizon {
            return Err(MpcError::DimensionMismatch {
                what: "controller horizon",
                expected: config.horizon,
                actual: solver.horizon(),
            });
        }
        let state = solver.init_state();
        let reference = CircleReference::from_config(&config);
        let targets = vec![Vector3::from(config.frame_translation_ref); config.horizon + 1];
        debug!("OCP to ctrl time ratio = {}", config.ocp_to_ctrl_ratio());
        debug!("Start of tracking phase in ctrl cycles = {}", config.track_start_cycle());

        Ok(Self {
            solver,
            state,
            config,
            reference,
            targets,
            phase: TaskPhase::Reach,
            cycle: 0,
            warm: false,
            last_command: None,
        })
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    /// Control cycles run so far.
    pub fn cycle(&self) -> usize {
        self.cycle
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn solver(&self) -> &Solver<D, C> {
        &self.solver
    }

    pub fn state(&self) -> &SolverState {
        &self.state
    }

    /// End-effector targets over the current horizon.
    pub fn targets(&self) -> &[Vector3<f64>] {
        &self.targets
    }

    fn read_state(&self, sensors: &mut impl SensorInterface) -> Result<DVector<f64>, MpcError> {
        let q = sensors.read(SensorChannel::JointPositions)?;
        let v = sensors.read(SensorChannel::JointVelocities)?;
        let (nq, nv) = (self.solver.dynamics().nq(), self.solver.dynamics().nv());
        for (what, expected, actual) in [("joint positions", nq, q.len()), ("joint velocities", nv, v.len())] {
            if expected != actual {
                return Err(MpcError::DimensionMismatch {
                    what,
                    expected,
                    actual,
                });
            }
        }
        let mut x = DVector::zeros(nq + nv);
        x.rows_mut(0, nq).copy_from(&q);
        x.rows_mut(nq, nv).copy_from(&v);
        Ok(x)
    }

    /// Constant-state guess with gravity-compensating controls.
    fn static_guess(&self, x: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let n = self.config.horizon;
        let dynamics = self.solver.dynamics();
        let u_grav = dynamics.gravity_torque(&x.rows(0, dynamics.nq()).into_owned());
        let xs = DMatrix::from_fn(x.len(), n + 1, |r, _| x[r]);
        let us = DMatrix::from_fn(u_grav.len(), n, |r, _| u_grav[r]);
        (xs, us)
    }

    /// Solve once from rest at the sensed state with the warm-up budget.
    /// Nothing is commanded.
    pub fn warmup(&mut self, sensors: &mut impl SensorInterface) -> Result<CycleReport, MpcError> {
        let x = self.read_state(sensors)?;
        let (xs, us) = self.static_guess(&x);
        let start = Instant::now();
        self.solver
            .solve(&mut self.state, &xs, &us, self.config.warmup_max_iter, false)?;
        let solve_time = start.elapsed();
        self.warm = true;
        info!(
            "warm-up solve: {} iterations, KKT = {:.3e}, {:?}",
            self.state.iter(),
            self.state.kkt(),
            solve_time
        );
        let u0 = self.state.u_at(0);
        Ok(self.report(u0.clone(), u0, solve_time, false))
    }

    /// Enter the tracking phase when its start cycle is reached, then push the
    /// horizon targets into the cost.
    fn update_task(&mut self) -> Result<(), MpcError> {
        let start = self.config.track_start_cycle();
        if self.phase == TaskPhase::Reach && self.cycle >= start {
            self.phase = TaskPhase::Track;
            info!("Entering tracking phase at cycle {}", self.cycle);
        }
        if self.phase != TaskPhase::Track {
            return Ok(());
        }

        let ratio = self.config.ocp_to_ctrl_ratio();
        let elapsed = self.cycle - start;
        if elapsed % ratio == 0 {
            for (k, target) in self.targets.iter_mut().enumerate() {
                *target = self.reference.sample(elapsed + k * ratio);
            }
        }

        let weight = self.config.tracking_weight;
        let cost = self.solver.cost_mut();
        cost.activate_term(CostTerm::FrameTranslation, true)?;
        for (k, target) in self.targets.iter().enumerate() {
            cost.set_reference(
                CostTerm::FrameTranslation,
                k,
                &DVector::from_column_slice(target.as_slice()),
            )?;
            cost.set_weight(CostTerm::FrameTranslation, k, weight)?;
        }
        Ok(())
    }

    /// One sense -> solve -> command cycle.
    ///
    /// Transient non-convergence never fails the cycle; the best first control
    /// found is always commanded (subject to the deadline policy).
    pub fn run_cycle(
        &mut self,
        sensors: &mut impl SensorInterface,
        actuators: &mut impl ActuatorInterface,
    ) -> Result<CycleReport, MpcError> {
        let x = self.read_state(sensors)?;
        self.update_task()?;

        let (xs, us) = if self.warm {
            self.state.shift_admm();
            shift_trajectory(self.state.xs(), self.state.us(), &x)
        } else {
            self.static_guess(&x)
        };

        let start = Instant::now();
        self.solver
            .solve(&mut self.state, &xs, &us, self.config.max_iter, self.warm)?;
        let solve_time = start.elapsed();
        self.warm = true;

        let u0 = self.state.u_at(0);
        let mut command = u0.clone();
        if !self.config.run_sim {
            let q = x.rows(0, self.solver.dynamics().nq()).into_owned();
            command -= self.solver.dynamics().gravity_torque(&q);
        }

        let overrun = solve_time.as_secs_f64() > self.config.cycle_budget();
        if overrun {
            warn!(
                "cycle {}: solve took {:?}, budget {:.3e} s",
                self.cycle,
                solve_time,
                self.config.cycle_budget()
            );
            if let (DeadlinePolicy::HoldPrevious, Some(previous)) =
                (self.config.deadline, &self.last_command)
            {
                command = previous.clone();
            }
        }

        actuators.write(ActuatorChannel::JointTorques, &command)?;
        let report = self.report(command.clone(), u0, solve_time, overrun);
        self.last_command = Some(command);
        self.cycle += 1;
        Ok(report)
    }

    fn report(
        &self,
        command: DVector<f64>,
        u0: DVector<f64>,
        solve_time: Duration,
        overrun: bool,
    ) -> CycleReport {
        CycleReport {
            cycle: self.cycle,
            phase: self.phase,
            command,
            u0,
            x_des: self.state.x_at(1),
            gain: self.state.gain(0).clone(),
            solve_time,
            iter: self.state.iter(),
            kkt: self.state.kkt(),
            converged: self.state.converged(),
            overrun,
        }
    }
}
