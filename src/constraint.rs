//! Inequality constraints `lb <= g(x, u) <= ub` attached to each knot point.

use nalgebra::{DMatrix, DVector, Vector3};

use crate::error::MpcError;
use crate::model::FrameKinematics;

/// Position of a knot point in the horizon.
///
/// The initial state is fixed to the measurement, so only control-dependent
/// rows are kept there; the terminal knot has no control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Initial,
    Running,
    Terminal,
}

impl StageKind {
    pub fn of(stage: usize, horizon: usize) -> Self {
        if stage == horizon {
            StageKind::Terminal
        } else if stage == 0 {
            StageKind::Initial
        } else {
            StageKind::Running
        }
    }

    fn has_state_rows(self) -> bool {
        self != StageKind::Initial
    }

    fn has_control_rows(self) -> bool {
        self != StageKind::Terminal
    }
}

/// Penalty class of a constraint row, fixed by its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowClass {
    /// Both bounds infinite: never active.
    Free,
    Inequality,
    /// `lb == ub`.
    Equality,
}

impl RowClass {
    pub fn from_bounds(lb: f64, ub: f64) -> Self {
        if lb == f64::NEG_INFINITY && ub == f64::INFINITY {
            RowClass::Free
        } else if lb == ub {
            RowClass::Equality
        } else {
            RowClass::Inequality
        }
    }
}

/// Constraint value and Jacobians at one knot point.
#[derive(Debug, Clone)]
pub struct ConstraintData {
    pub g: DVector<f64>,
    pub jx: DMatrix<f64>,
    pub ju: DMatrix<f64>,
}

impl ConstraintData {
    pub fn empty(nx: usize, nu: usize) -> Self {
        Self {
            g: DVector::zeros(0),
            jx: DMatrix::zeros(0, nx),
            ju: DMatrix::zeros(0, nu),
        }
    }

    pub fn nc(&self) -> usize {
        self.g.len()
    }

    fn stack(parts: Vec<ConstraintData>, nx: usize, nu: usize) -> Self {
        let nc = parts.iter().map(ConstraintData::nc).sum();
        let mut out = ConstraintData {
            g: DVector::zeros(nc),
            jx: DMatrix::zeros(nc, nx),
            ju: DMatrix::zeros(nc, nu),
        };
        let mut row = 0;
        for part in parts {
            let n = part.nc();
            out.g.rows_mut(row, n).copy_from(&part.g);
            out.jx.rows_mut(row, n).copy_from(&part.jx);
            out.ju.rows_mut(row, n).copy_from(&part.ju);
            row += n;
        }
        out
    }
}

/// A stage constraint model.
#[derive(Debug, Clone)]
pub enum ConstraintModel {
    /// Identity on the control with infinite bounds.
    Unconstrained,
    StateBox { lb: DVector<f64>, ub: DVector<f64> },
    ControlBox { lb: DVector<f64>, ub: DVector<f64> },
    /// Box on the end-effector position.
    FrameBox { lb: Vector3<f64>, ub: Vector3<f64> },
    /// Half-space `normal . p >= offset` on the end-effector position.
    FrameHalfspace { normal: Vector3<f64>, offset: f64 },
    /// Rows of the sub-models, stacked in order.
    Composite(Vec<ConstraintModel>),
}

impl ConstraintModel {
    /// Number of rows at a knot point of the given kind.
    pub fn nc(&self, nx: usize, nu: usize, kind: StageKind) -> usize {
        match self {
            ConstraintModel::Unconstrained | ConstraintModel::ControlBox { .. } => {
                if kind.has_control_rows() { nu } else { 0 }
            }
            ConstraintModel::StateBox { .. } => {
                if kind.has_state_rows() { nx } else { 0 }
            }
            ConstraintModel::FrameBox { .. } => {
                if kind.has_state_rows() { 3 } else { 0 }
            }
            ConstraintModel::FrameHalfspace { .. } => usize::from(kind.has_state_rows()),
            ConstraintModel::Composite(models) => {
                models.iter().map(|m| m.nc(nx, nu, kind)).sum()
            }
        }
    }

    pub fn needs_kinematics(&self) -> bool {
        match self {
            ConstraintModel::FrameBox { .. } | ConstraintModel::FrameHalfspace { .. } => true,
            ConstraintModel::Composite(models) => models.iter().any(Self::needs_kinematics),
            _ => false,
        }
    }

    /// Lower and upper bounds of the rows present at `kind`.
    pub fn bounds(&self, nx: usize, nu: usize, kind: StageKind) -> (DVector<f64>, DVector<f64>) {
        let mut lb = Vec::with_capacity(self.nc(nx, nu, kind));
        let mut ub = Vec::with_capacity(lb.capacity());
        self.collect_bounds(nu, kind, &mut lb, &mut ub);
        (DVector::from_vec(lb), DVector::from_vec(ub))
    }

    fn collect_bounds(&self, nu: usize, kind: StageKind, lb: &mut Vec<f64>, ub: &mut Vec<f64>) {
        match self {
            ConstraintModel::Unconstrained if kind.has_control_rows() => {
                lb.extend(std::iter::repeat_n(f64::NEG_INFINITY, nu));
                ub.extend(std::iter::repeat_n(f64::INFINITY, nu));
            }
            ConstraintModel::ControlBox { lb: l, ub: u } if kind.has_control_rows() => {
                lb.extend(l.iter());
                ub.extend(u.iter());
            }
            ConstraintModel::StateBox { lb: l, ub: u } if kind.has_state_rows() => {
                lb.extend(l.iter());
                ub.extend(u.iter());
            }
            ConstraintModel::FrameBox { lb: l, ub: u } if kind.has_state_rows() => {
                lb.extend(l.iter());
                ub.extend(u.iter());
            }
            ConstraintModel::FrameHalfspace { offset, .. } if kind.has_state_rows() => {
                lb.push(*offset);
                ub.push(f64::INFINITY);
            }
            ConstraintModel::Composite(models) => {
                for m in models {
                    m.collect_bounds(nu, kind, lb, ub);
                }
            }
            _ => {}
        }
    }

    /// Check sizes and bound consistency. `lb > ub` is a fatal configuration error.
    pub fn validate(&self, stage: usize, nx: usize, nu: usize) -> Result<(), MpcError> {
        self.check_shapes(nx, nu)?;
        let (lb, ub) = self.bounds(nx, nu, StageKind::Running);
        for (row, (&l, &u)) in lb.iter().zip(ub.iter()).enumerate() {
            if l.is_nan() || u.is_nan() || l > u || l == f64::INFINITY || u == f64::NEG_INFINITY {
                return Err(MpcError::InfeasibleBounds {
                    stage,
                    row,
                    lb: l,
                    ub: u,
                });
            }
        }
        Ok(())
    }

    fn check_shapes(&self, nx: usize, nu: usize) -> Result<(), MpcError> {
        let check = |what, expected, l: &DVector<f64>, u: &DVector<f64>| {
            for actual in [l.len(), u.len()] {
                if actual != expected {
                    return Err(MpcError::DimensionMismatch {
                        what,
                        expected,
                        actual,
                    });
                }
            }
            Ok(())
        };
        match self {
            ConstraintModel::StateBox { lb, ub } => check("state box bounds", nx, lb, ub),
            ConstraintModel::ControlBox { lb, ub } => check("control box bounds", nu, lb, ub),
            ConstraintModel::FrameHalfspace { normal, .. } => {
                let norm = normal.norm();
                if norm.is_finite() && norm > 0.0 {
                    Ok(())
                } else {
                    Err(MpcError::InvalidConstraint(format!(
                        "half-space normal {normal:?} is degenerate"
                    )))
                }
            }
            ConstraintModel::Composite(models) => {
                models.iter().try_for_each(|m| m.check_shapes(nx, nu))
            }
            _ => Ok(()),
        }
    }

    /// Value `g(x, u)` and its Jacobians at a knot point.
    pub fn evaluate(
        &self,
        kinematics: Option<&dyn FrameKinematics>,
        nq: usize,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
        kind: StageKind,
    ) -> Result<ConstraintData, MpcError> {
        let nx = x.len();
        let control = u.cloned().unwrap_or_else(|| DVector::zeros(0));
        let nu = match u {
            Some(u) => u.len(),
            None => 0,
        };
        if self.nc(nx, nu, kind) == 0 {
            return Ok(ConstraintData::empty(nx, nu));
        }

        let data = match self {
            ConstraintModel::Unconstrained | ConstraintModel::ControlBox { .. } => ConstraintData {
                g: control,
                jx: DMatrix::zeros(nu, nx),
                ju: DMatrix::identity(nu, nu),
            },
            ConstraintModel::StateBox { .. } => ConstraintData {
                g: x.clone(),
                jx: DMatrix::identity(nx, nx),
                ju: DMatrix::zeros(nx, nu),
            },
            ConstraintModel::FrameBox { .. } => {
                let (p, jx) = frame_rows(kinematics, nq, x)?;
                ConstraintData {
                    g: DVector::from_column_slice(p.as_slice()),
                    jx,
                    ju: DMatrix::zeros(3, nu),
                }
            }
            ConstraintModel::FrameHalfspace { normal, .. } => {
                let (p, jp) = frame_rows(kinematics, nq, x)?;
                let n = DMatrix::from_column_slice(3, 1, normal.as_slice());
                ConstraintData {
                    g: DVector::from_element(1, normal.dot(&p)),
                    jx: n.tr_mul(&jp),
                    ju: DMatrix::zeros(1, nu),
                }
            }
            ConstraintModel::Composite(models) => {
                let parts = models
                    .iter()
                    .map(|m| m.evaluate(kinematics, nq, x, u, kind))
                    .collect::<Result<Vec<_>, _>>()?;
                ConstraintData::stack(parts, nx, nu)
            }
        };
        Ok(data)
    }
}

/// End-effector position and its Jacobian w.r.t. the full state (3 x nx).
fn frame_rows(
    kinematics: Option<&dyn FrameKinematics>,
    nq: usize,
    x: &DVector<f64>,
) -> Result<(Vector3<f64>, DMatrix<f64>), MpcError> {
    let kin = kinematics.ok_or(MpcError::MissingKinematics)?;
    let q = x.rows(0, nq).into_owned();
    let jac = kin.frame_jacobian(&q);
    let mut jx = DMatrix::zeros(3, x.len());
    jx.view_mut((0, 0), (3, jac.ncols())).copy_from(&jac);
    Ok((kin.frame_translation(&q), jx))
}

/// Bounds and row classes of one knot point, fixed at problem construction.
#[derive(Debug, Clone)]
pub struct StageLayout {
    pub kind: StageKind,
    pub lb: DVector<f64>,
    pub ub: DVector<f64>,
    pub classes: Vec<RowClass>,
}

impl StageLayout {
    pub fn new(model: &ConstraintModel, nx: usize, nu: usize, kind: StageKind) -> Self {
        let (lb, ub) = model.bounds(nx, nu, kind);
        let classes = lb
            .iter()
            .zip(ub.iter())
            .map(|(&l, &u)| RowClass::from_bounds(l, u))
            .collect();
        Self {
            kind,
            lb,
            ub,
            classes,
        }
    }

    pub fn nc(&self) -> usize {
        self.lb.len()
    }

    /// l1 distance of `g` to the box.
    pub fn violation(&self, g: &DVector<f64>) -> f64 {
        g.iter()
            .zip(self.lb.iter().zip(self.ub.iter()))
            .map(|(&v, (&l, &u))| (l - v).max(0.0) + (v - u).max(0.0))
            .sum()
    }

    /// Largest single-row distance of `g` to the box.
    pub fn max_violation(&self, g: &DVector<f64>) -> f64 {
        g.iter()
            .zip(self.lb.iter().zip(self.ub.iter()))
            .fold(0.0, |m, (&v, (&l, &u))| m.max(l - v).max(v - u))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PlanarPoint;

    // p = (q0, q1, 0.5)
    impl FrameKinematics for PlanarPoint {
        fn frame_translation(&self, q: &DVector<f64>) -> Vector3<f64> {
            Vector3::new(q[0], q[1], 0.5)
        }

        fn frame_jacobian(&self, _q: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0])
        }
    }

    fn composite() -> ConstraintModel {
        ConstraintModel::Composite(vec![
            ConstraintModel::StateBox {
                lb: DVector::from_element(4, -1.0),
                ub: DVector::from_element(4, 1.0),
            },
            ConstraintModel::ControlBox {
                lb: DVector::from_element(2, -2.0),
                ub: DVector::from_element(2, 2.0),
            },
            ConstraintModel::FrameHalfspace {
                normal: Vector3::new(0.0, 1.0, 0.0),
                offset: 0.1,
            },
        ])
    }

    #[test]
    fn composite_rows_depend_on_stage_kind() {
        let c = composite();
        assert_eq!(c.nc(4, 2, StageKind::Initial), 2);
        assert_eq!(c.nc(4, 2, StageKind::Running), 7);
        assert_eq!(c.nc(4, 2, StageKind::Terminal), 5);
        assert!(c.needs_kinematics());
    }

    #[test]
    fn composite_stacks_values_and_jacobians() {
        let c = composite();
        let x = DVector::from_vec(vec![0.2, 0.3, -0.1, 0.0]);
        let u = DVector::from_vec(vec![1.5, -0.5]);
        let d = c
            .evaluate(Some(&PlanarPoint), 2, &x, Some(&u), StageKind::Running)
            .unwrap();
        assert_eq!(d.nc(), 7);
        assert_eq!(d.g[4], 1.5);
        assert_eq!(d.g[6], 0.3);
        assert_eq!(d.jx[(6, 1)], 1.0);
        assert_eq!(d.ju[(5, 1)], 1.0);
        assert_eq!(d.jx[(4, 0)], 0.0);

        let (lb, ub) = c.bounds(4, 2, StageKind::Running);
        assert_eq!(lb[6], 0.1);
        assert_eq!(ub[6], f64::INFINITY);
    }

    #[test]
    fn frame_rows_need_kinematics() {
        let c = ConstraintModel::FrameBox {
            lb: Vector3::from_element(-1.0),
            ub: Vector3::from_element(1.0),
        };
        let x = DVector::zeros(4);
        let err = c.evaluate(None, 2, &x, None, StageKind::Terminal).unwrap_err();
        assert!(matches!(err, MpcError::MissingKinematics));
    }

    #[test]
    fn unconstrained_is_free_identity_on_control() {
        let layout = StageLayout::new(&ConstraintModel::Unconstrained, 4, 2, StageKind::Running);
        assert_eq!(layout.classes, vec![RowClass::Free; 2]);
        assert_eq!(ConstraintModel::Unconstrained.nc(4, 2, StageKind::Terminal), 0);
    }

    #[test]
    fn crossed_bounds_are_rejected() {
        let c = ConstraintModel::ControlBox {
            lb: DVector::from_vec(vec![0.0, 1.0]),
            ub: DVector::from_vec(vec![1.0, 0.5]),
        };
        let err = c.validate(3, 4, 2).unwrap_err();
        assert!(matches!(err, MpcError::InfeasibleBounds { stage: 3, row: 1, .. }));
    }

    #[test]
    fn row_classes_follow_bounds() {
        let c = ConstraintModel::FrameBox {
            lb: Vector3::new(f64::NEG_INFINITY, 0.2, 0.0),
            ub: Vector3::new(f64::INFINITY, 0.2, 1.0),
        };
        let layout = StageLayout::new(&c, 4, 2, StageKind::Terminal);
        assert_eq!(
            layout.classes,
            vec![RowClass::Free, RowClass::Equality, RowClass::Inequality]
        );
        let g = DVector::from_vec(vec![5.0, 0.3, -0.5]);
        assert!((layout.violation(&g) - 0.6).abs() < 1e-12);
        assert!((layout.max_violation(&g) - 0.5).abs() < 1e-12);
    }
}
