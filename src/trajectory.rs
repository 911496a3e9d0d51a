use nalgebra::{DMatrix, DVector};

/// Receding-horizon warm start: drop the first knot point, duplicate the last
/// state and control as the new tail, and pin the first state to `x_now`.
pub fn shift_trajectory(
    xs: &DMatrix<f64>,
    us: &DMatrix<f64>,
    x_now: &DVector<f64>,
) -> (DMatrix<f64>, DMatrix<f64>) {
    (shift_columns(xs, Some(x_now)), shift_columns(us, None))
}

fn shift_columns(m: &DMatrix<f64>, first: Option<&DVector<f64>>) -> DMatrix<f64> {
    let cols = m.ncols();
    let mut out = m.clone();
    if cols > 1 {
        out.columns_mut(0, cols - 1)
            .copy_from(&m.columns(1, cols - 1));
    }
    if let Some(first) = first {
        out.set_column(0, first);
    }
    out
}
