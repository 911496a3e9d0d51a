//! Reference dynamics and cost models.

mod arm;
mod cost;
mod linear;

pub use arm::{SerialArm, SerialChain};
pub use cost::{QuadraticCost, TrackingCost, riccati_terminal};
pub use linear::LinearDynamics;
