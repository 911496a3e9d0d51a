//! Adaptive ADMM penalty (rho) policies.
//!
//! Both policies see the same residuals and the same scaling factor; they only
//! differ in how the penalty is stored and rescaled, so on identical inputs
//! they produce the same per-row penalties.

use std::fmt;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::constraint::{RowClass, StageLayout};

const EPS: f64 = 1e-10;

/// Which [`PenaltyAdaptation`] the solver runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdmmVariant {
    /// One penalty per constraint coordinate.
    #[default]
    Sparse,
    /// One global penalty, Boyd et al. residual balancing.
    Boyd,
}

/// Clipping range of the penalty and the multiplier applied to equality rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PenaltyLimits {
    pub rho_min: f64,
    pub rho_max: f64,
    pub equality_scale: f64,
}

impl PenaltyLimits {
    /// Penalty of a row of class `class` when the base penalty is `rho`.
    pub fn row_penalty(&self, class: RowClass, rho: f64) -> f64 {
        match class {
            RowClass::Free => self.rho_min,
            RowClass::Inequality => rho,
            RowClass::Equality => self.equality_scale * rho,
        }
    }

    fn row_range(&self, class: RowClass) -> (f64, f64) {
        match class {
            RowClass::Free => (self.rho_min, self.rho_min),
            RowClass::Inequality => (self.rho_min, self.rho_max),
            RowClass::Equality => (
                self.equality_scale * self.rho_min,
                self.equality_scale * self.rho_max,
            ),
        }
    }
}

/// Penalty storage and adaptation.
pub trait PenaltyAdaptation: fmt::Debug {
    fn variant(&self) -> AdmmVariant;

    /// Reinitialise every row penalty from the base value `rho`.
    fn reset(&mut self, layout: &[StageLayout], rho: f64);

    /// Row penalties of knot point `stage`.
    fn stage_penalty(&self, stage: usize) -> DVector<f64>;

    /// Multiply the penalties by `scale`, within the limits.
    fn rescale(&mut self, scale: f64);

    /// Number of knot points covered.
    fn stages(&self) -> usize;

    /// Penalties of all knot points.
    fn penalties(&self) -> Vec<DVector<f64>> {
        (0..self.stages()).map(|k| self.stage_penalty(k)).collect()
    }
}

/// Per-coordinate penalties, each rescaled on its own.
#[derive(Debug, Clone)]
pub struct SparsePenalty {
    limits: PenaltyLimits,
    classes: Vec<Vec<RowClass>>,
    rho: Vec<DVector<f64>>,
}

impl SparsePenalty {
    pub fn new(limits: PenaltyLimits) -> Self {
        Self {
            limits,
            classes: Vec::new(),
            rho: Vec::new(),
        }
    }
}

impl PenaltyAdaptation for SparsePenalty {
    fn variant(&self) -> AdmmVariant {
        AdmmVariant::Sparse
    }

    fn reset(&mut self, layout: &[StageLayout], rho: f64) {
        let rho = rho.clamp(self.limits.rho_min, self.limits.rho_max);
        self.classes = layout.iter().map(|s| s.classes.clone()).collect();
        self.rho = self
            .classes
            .iter()
            .map(|classes| {
                DVector::from_iterator(
                    classes.len(),
                    classes.iter().map(|&c| self.limits.row_penalty(c, rho)),
                )
            })
            .collect();
    }

    fn stage_penalty(&self, stage: usize) -> DVector<f64> {
        self.rho[stage].clone()
    }

    fn rescale(&mut self, scale: f64) {
        for (rho, classes) in self.rho.iter_mut().zip(&self.classes) {
            for (r, &class) in rho.iter_mut().zip(classes) {
                let (lo, hi) = self.limits.row_range(class);
                *r = (*r * scale).clamp(lo, hi);
            }
        }
    }

    fn stages(&self) -> usize {
        self.rho.len()
    }
}

/// A single scalar penalty shared by every row.
#[derive(Debug, Clone)]
pub struct BoydPenalty {
    limits: PenaltyLimits,
    classes: Vec<Vec<RowClass>>,
    rho: f64,
}

impl BoydPenalty {
    pub fn new(limits: PenaltyLimits) -> Self {
        Self {
            limits,
            classes: Vec::new(),
            rho: limits.rho_min,
        }
    }

    pub fn rho(&self) -> f64 {
        self.rho
    }
}

impl PenaltyAdaptation for BoydPenalty {
    fn variant(&self) -> AdmmVariant {
        AdmmVariant::Boyd
    }

    fn reset(&mut self, layout: &[StageLayout], rho: f64) {
        self.rho = rho.clamp(self.limits.rho_min, self.limits.rho_max);
        self.classes = layout.iter().map(|s| s.classes.clone()).collect();
    }

    fn stage_penalty(&self, stage: usize) -> DVector<f64> {
        let classes = &self.classes[stage];
        DVector::from_iterator(
            classes.len(),
            classes
                .iter()
                .map(|&c| self.limits.row_penalty(c, self.rho)),
        )
    }

    fn rescale(&mut self, scale: f64) {
        self.rho = (self.rho * scale).clamp(self.limits.rho_min, self.limits.rho_max);
    }

    fn stages(&self) -> usize {
        self.classes.len()
    }
}

/// Build the policy selected by `variant`.
pub fn penalty_policy(variant: AdmmVariant, limits: PenaltyLimits) -> Box<dyn PenaltyAdaptation> {
    match variant {
        AdmmVariant::Sparse => Box::new(SparsePenalty::new(limits)),
        AdmmVariant::Boyd => Box::new(BoydPenalty::new(limits)),
    }
}

/// Residual-balancing factor `sqrt((r_p / |primal|) / (r_d / |dual|))`.
pub fn predict_scale(pri_res: f64, dual_res: f64, pri_norm: f64, dual_norm: f64) -> f64 {
    let normalized_pri = pri_res / (pri_norm + EPS);
    let normalized_dual = dual_res / (dual_norm + EPS);
    (normalized_pri / (normalized_dual + EPS)).sqrt()
}

/// Rescale only when the factor leaves `[1/tau, tau]`.
///
/// A zero factor means no active row moved, so it never triggers.
pub fn should_rescale(scale: f64, tau: f64) -> bool {
    scale.is_finite() && scale > 0.0 && (scale > tau || scale < 1.0 / tau)
}
