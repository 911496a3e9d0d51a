use nalgebra::{DMatrix, DVector, Rotation3, Unit, Vector3};

use crate::error::MpcError;
use crate::model::{DynamicsModel, FrameKinematics};

/// Serial chain of revolute joints ending in a tool frame.
///
/// Joint `i` sits at `offsets[i]` in the frame of joint `i - 1` and rotates
/// about `axes[i]`, expressed in that same frame.
#[derive(Debug, Clone)]
pub struct SerialChain {
    axes: Vec<Unit<Vector3<f64>>>,
    offsets: Vec<Vector3<f64>>,
    tool: Vector3<f64>,
}

impl SerialChain {
    pub fn new(
        axes: Vec<Vector3<f64>>,
        offsets: Vec<Vector3<f64>>,
        tool: Vector3<f64>,
    ) -> Result<Self, MpcError> {
        if axes.len() != offsets.len() {
            return Err(MpcError::DimensionMismatch {
                what: "joint offsets",
                expected: axes.len(),
                actual: offsets.len(),
            });
        }
        let axes = axes
            .into_iter()
            .map(|a| {
                Unit::try_new(a, 1e-12).ok_or_else(|| {
                    MpcError::InvalidConstraint(format!("joint axis {a:?} is degenerate"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            axes,
            offsets,
            tool,
        })
    }

    /// 7-DOF layout of a KUKA iiwa 14 (link lengths in metres).
    pub fn iiwa() -> Self {
        let z = Vector3::z_axis();
        let y = Vector3::y_axis();
        let neg_y = Unit::new_unchecked(-Vector3::y());
        Self {
            axes: vec![z, y, z, neg_y, z, y, z],
            offsets: vec![
                Vector3::new(0.0, 0.0, 0.1575),
                Vector3::new(0.0, 0.0, 0.2025),
                Vector3::new(0.0, 0.0, 0.2045),
                Vector3::new(0.0, 0.0, 0.2155),
                Vector3::new(0.0, 0.0, 0.1845),
                Vector3::new(0.0, 0.0, 0.2155),
                Vector3::new(0.0, 0.0, 0.0810),
            ],
            tool: Vector3::new(0.0, 0.0, 0.126),
        }
    }

    pub fn dof(&self) -> usize {
        self.axes.len()
    }

    /// World origins and axes of the joints, and the tool position.
    fn frames(&self, q: &DVector<f64>) -> (Vec<Vector3<f64>>, Vec<Vector3<f64>>, Vector3<f64>) {
        let mut rot = Rotation3::identity();
        let mut p = Vector3::zeros();
        let mut origins = Vec::with_capacity(self.dof());
        let mut world_axes = Vec::with_capacity(self.dof());
        for ((axis, offset), &qi) in self.axes.iter().zip(&self.offsets).zip(q.iter()) {
            p += rot * offset;
            origins.push(p);
            world_axes.push(rot * axis.into_inner());
            rot *= Rotation3::from_axis_angle(axis, qi);
        }
        (origins, world_axes, p + rot * self.tool)
    }
}

impl FrameKinematics for SerialChain {
    fn frame_translation(&self, q: &DVector<f64>) -> Vector3<f64> {
        self.frames(q).2
    }

    fn frame_jacobian(&self, q: &DVector<f64>) -> DMatrix<f64> {
        let (origins, axes, tool) = self.frames(q);
        let mut jac = DMatrix::zeros(3, self.dof());
        for (i, (o, a)) in origins.iter().zip(&axes).enumerate() {
            jac.fixed_view_mut::<3, 1>(0, i).copy_from(&a.cross(&(tool - o)));
        }
        jac
    }
}

/// Fully actuated arm with diagonal inertia, viscous damping and decoupled
/// gravity torque `G_i sin(q_i)`, integrated with semi-implicit Euler.
#[derive(Debug, Clone)]
pub struct SerialArm {
    chain: SerialChain,
    inertia: DVector<f64>,
    damping: DVector<f64>,
    gravity: DVector<f64>,
    dt: f64,
}

impl SerialArm {
    pub fn new(
        chain: SerialChain,
        inertia: DVector<f64>,
        damping: DVector<f64>,
        gravity: DVector<f64>,
        dt: f64,
    ) -> Result<Self, MpcError> {
        let n = chain.dof();
        for (what, v) in [("inertia", &inertia), ("damping", &damping), ("gravity", &gravity)] {
            if v.len() != n {
                return Err(MpcError::DimensionMismatch {
                    what,
                    expected: n,
                    actual: v.len(),
                });
            }
        }
        if inertia.iter().any(|m| !(*m > 0.0)) || !(dt > 0.0) {
            return Err(MpcError::InvalidConstraint(
                "arm inertia and time step must be positive".to_string(),
            ));
        }
        Ok(Self {
            chain,
            inertia,
            damping,
            gravity,
            dt,
        })
    }

    /// iiwa-like arm integrated at `dt`.
    pub fn iiwa(dt: f64) -> Result<Self, MpcError> {
        Self::new(
            SerialChain::iiwa(),
            DVector::from_vec(vec![1.2, 1.2, 0.6, 0.6, 0.3, 0.2, 0.1]),
            DVector::from_element(7, 0.5),
            DVector::from_vec(vec![0.0, 30.0, 0.0, 12.0, 0.0, 1.5, 0.0]),
            dt,
        )
    }

    pub fn chain(&self) -> &SerialChain {
        &self.chain
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    fn acceleration(&self, q: &DVector<f64>, v: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        let tau = u - self.damping.component_mul(v) - self.gravity_torque(q);
        tau.component_div(&self.inertia)
    }
}

impl DynamicsModel for SerialArm {
    fn nq(&self) -> usize {
        self.chain.dof()
    }

    fn nv(&self) -> usize {
        self.chain.dof()
    }

    fn nu(&self) -> usize {
        self.chain.dof()
    }

    fn step(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        let n = self.nq();
        let q = x.rows(0, n).into_owned();
        let v = x.rows(n, n).into_owned();
        let v_next = &v + self.acceleration(&q, &v, u) * self.dt;
        let q_next = q + &v_next * self.dt;
        let mut out = DVector::zeros(2 * n);
        out.rows_mut(0, n).copy_from(&q_next);
        out.rows_mut(n, n).copy_from(&v_next);
        out
    }

    fn linearize(&self, x: &DVector<f64>, _u: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let n = self.nq();
        let dt = self.dt;
        let mut fx = DMatrix::zeros(2 * n, 2 * n);
        let mut fu = DMatrix::zeros(2 * n, n);
        for i in 0..n {
            let da_dq = -self.gravity[i] * x[i].cos() / self.inertia[i];
            let da_dv = -self.damping[i] / self.inertia[i];
            let da_du = 1.0 / self.inertia[i];

            // v+ = v + dt a, q+ = q + dt v+
            let dv_dq = dt * da_dq;
            let dv_dv = 1.0 + dt * da_dv;
            let dv_du = dt * da_du;
            fx[(n + i, i)] = dv_dq;
            fx[(n + i, n + i)] = dv_dv;
            fx[(i, i)] = 1.0 + dt * dv_dq;
            fx[(i, n + i)] = dt * dv_dv;
            fu[(n + i, i)] = dv_du;
            fu[(i, i)] = dt * dv_du;
        }
        (fx, fu)
    }

    fn gravity_torque(&self, q: &DVector<f64>) -> DVector<f64> {
        self.gravity.component_mul(&q.map(f64::sin))
    }

    fn kinematics(&self) -> Option<&dyn FrameKinematics> {
        Some(&self.chain)
    }
}
