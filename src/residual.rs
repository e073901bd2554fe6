//! Residual of the discretised equation of motion:
//!
//!   gᵢ(x) = mᵢ (xᵢ − yᵢ) − h² f_int,ᵢ(x)
//!
//! where y is the implicit-Euler predictor.  The norm of the mapped g is
//! the convergence measure of the iterative integrator.

use crate::assembly::{flatten, spmv};
use crate::integrator::StepContext;
use crate::types::SimError;
use ndarray::Array2;

/// ‖P g‖₂ with P = `ctx.residual_map` (identity when absent).
///
/// `internal` may carry precomputed spring forces at `positions_for_forces`;
/// when `None` they are recomputed.  `x_new` and `predicted` are flat 3N
/// vectors.
pub fn residual_norm(
    ctx: &StepContext<'_>,
    predicted: &[f64],
    internal: Option<&Array2<f64>>,
    x_new: &[f64],
    positions_for_forces: &Array2<f64>,
) -> Result<f64, SimError> {
    let dim = 3 * ctx.masses.len();
    if predicted.len() != dim || x_new.len() != dim {
        return Err(SimError::Shape(format!(
            "residual expects vectors of length {dim}, got {} and {}",
            predicted.len(),
            x_new.len()
        )));
    }

    let recomputed;
    let f_int = match internal {
        Some(f) => f,
        None => {
            recomputed = ctx.model.internal_forces(ctx.topology, positions_for_forces)?;
            &recomputed
        }
    };
    let f_int = flatten(f_int);
    if f_int.len() != dim {
        return Err(SimError::Shape(format!(
            "internal forces have length {}, expected {dim}",
            f_int.len()
        )));
    }

    let h2 = ctx.h * ctx.h;
    let mut g = vec![0.0; dim];
    for (i, &m) in ctx.masses.iter().enumerate() {
        for d in 0..3 {
            let k = 3 * i + d;
            g[k] = m * (x_new[k] - predicted[k]) - h2 * f_int[k];
        }
    }

    let norm = |v: &[f64]| v.iter().map(|c| c * c).sum::<f64>().sqrt();
    Ok(match ctx.residual_map {
        Some(p) => norm(spmv(p, &g).as_slice()),
        None => norm(g.as_slice()),
    })
}
