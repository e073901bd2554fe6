//! Global system assembly: mass matrix M, spring Jacobian K, right-hand
//! sides and the sparse helpers the integrators share.
//!
//! All matrices are 3N × 3N and built from 3×3 blocks in a local
//! `TriMat`, then compressed to CSC.  Nothing is retained between steps.

use crate::forces::SpringModel;
use crate::topology::Topology;
use crate::types::{Coupling, ResidualSelection, SimError};
use nalgebra::Matrix3;
use ndarray::Array2;
use sprs::{CsMat, TriMat};

// ─────────────────────────────────────────────────────────────
//  Block helpers
// ─────────────────────────────────────────────────────────────

/// Add `sign · block` at block position (bi, bj).
fn add_block(tri: &mut TriMat<f64>, bi: usize, bj: usize, block: &Matrix3<f64>, sign: f64) {
    for r in 0..3 {
        for c in 0..3 {
            tri.add_triplet(3 * bi + r, 3 * bj + c, sign * block[(r, c)]);
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Mass matrix  M
// ─────────────────────────────────────────────────────────────

/// Diagonal mass matrix, block i = mᵢ I₃.
pub fn assemble_mass(masses: &[f64]) -> CsMat<f64> {
    let dim = 3 * masses.len();
    let mut tri = TriMat::with_capacity((dim, dim), dim);
    for (i, &m) in masses.iter().enumerate() {
        for d in 0..3 {
            tri.add_triplet(3 * i + d, 3 * i + d, m);
        }
    }
    tri.to_csc()
}

// ─────────────────────────────────────────────────────────────
//  Jacobian  K = ∂f_int/∂x
// ─────────────────────────────────────────────────────────────

/// Assemble the spring Jacobian at `positions`.
///
/// Each edge is visited once.  Kᵢᵢ = ∂fᵢ/∂xᵢ goes into (i,i) and (j,j);
/// with [`Coupling::Coupled`] −Kᵢᵢ also goes into (i,j) and (j,i).
/// Blocks are written even when numerically zero, so the pattern depends on
/// the topology only.
pub fn assemble_stiffness(
    topology: &Topology,
    model: &SpringModel,
    positions: &Array2<f64>,
    coupling: Coupling,
) -> Result<CsMat<f64>, SimError> {
    let n = positions.nrows();
    let dim = 3 * n;
    let blocks_per_edge = match coupling {
        Coupling::Coupled => 4,
        Coupling::BlockDiagonal => 2,
    };
    let mut tri = TriMat::with_capacity((dim, dim), 9 * blocks_per_edge * topology.num_edges());

    for &(i, j) in topology.edges() {
        let k_ii = model.jacobian(topology, positions, i, j)?;
        debug_assert!(
            (k_ii - k_ii.transpose()).amax() <= 1e-9 * (1.0 + k_ii.amax()),
            "spring Jacobian block for ({i},{j}) is not symmetric"
        );
        add_block(&mut tri, i, i, &k_ii, 1.0);
        add_block(&mut tri, j, j, &k_ii, 1.0);
        if coupling == Coupling::Coupled {
            add_block(&mut tri, i, j, &k_ii, -1.0);
            add_block(&mut tri, j, i, &k_ii, -1.0);
        }
    }

    Ok(tri.to_csc())
}

// ─────────────────────────────────────────────────────────────
//  Sparse combinations
// ─────────────────────────────────────────────────────────────

/// α A + β B  (same shape; union of both patterns).
pub fn linear_combination(a: &CsMat<f64>, alpha: f64, b: &CsMat<f64>, beta: f64) -> Result<CsMat<f64>, SimError> {
    if a.shape() != b.shape() {
        return Err(SimError::Shape(format!(
            "cannot combine {:?} with {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let mut tri = TriMat::with_capacity(a.shape(), a.nnz() + b.nnz());
    for (&v, (row, col)) in a.iter() {
        tri.add_triplet(row, col, alpha * v);
    }
    for (&v, (row, col)) in b.iter() {
        tri.add_triplet(row, col, beta * v);
    }
    Ok(tri.to_csc())
}

/// y = A x.  Walks the stored entries in place, whatever the storage order.
pub fn spmv(a: &CsMat<f64>, x: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; a.rows()];
    for (&v, (row, col)) in a.iter() {
        y[row] += v * x[col];
    }
    y
}

/// Selection map applied to the residual vector before taking its norm.
///
/// `None` for [`ResidualSelection::AllComponents`]: the norm is then taken
/// over the raw 3N vector without a multiply.
pub fn residual_map(num_particles: usize, selection: ResidualSelection) -> Option<CsMat<f64>> {
    match selection {
        ResidualSelection::AllComponents => None,
        ResidualSelection::Leading => {
            let dim = 3 * num_particles;
            let mut tri = TriMat::with_capacity((num_particles, dim), num_particles);
            for i in 0..num_particles {
                tri.add_triplet(i, i, 1.0);
            }
            Some(tri.to_csc())
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Dense  N × 3  <->  3N  conversion
// ─────────────────────────────────────────────────────────────

/// Flatten an `N × 3` array to `[x0, y0, z0, x1, ...]`.
pub fn flatten(arr: &Array2<f64>) -> Vec<f64> {
    let mut out = Vec::with_capacity(arr.nrows() * 3);
    for i in 0..arr.nrows() {
        for d in 0..3 {
            out.push(arr[[i, d]]);
        }
    }
    out
}

/// Inverse of [`flatten`].
pub fn unflatten(flat: &[f64]) -> Result<Array2<f64>, SimError> {
    if flat.len() % 3 != 0 {
        return Err(SimError::Shape(format!("flat vector length {} is not a multiple of 3", flat.len())));
    }
    Array2::from_shape_vec((flat.len() / 3, 3), flat.to_vec())
        .map_err(|e| SimError::Shape(e.to_string()))
}

// ─────────────────────────────────────────────────────────────
//  Right-hand sides
// ─────────────────────────────────────────────────────────────

/// f = f_ext + f_int, flattened.
pub fn total_forces(external: &Array2<f64>, internal: &Array2<f64>) -> Result<Vec<f64>, SimError> {
    if external.dim() != internal.dim() {
        return Err(SimError::Shape(format!(
            "external forces {:?} vs internal forces {:?}",
            external.dim(),
            internal.dim()
        )));
    }
    Ok(flatten(external)
        .into_iter()
        .zip(flatten(internal))
        .map(|(a, b)| a + b)
        .collect())
}

/// b = M v + h f  for the semi-implicit velocity solve.
pub fn semi_implicit_rhs(mass: &CsMat<f64>, velocities: &[f64], forces: &[f64], h: f64) -> Vec<f64> {
    let mut b = spmv(mass, velocities);
    for (bi, &fi) in b.iter_mut().zip(forces) {
        *bi += h * fi;
    }
    b
}

/// r = M y + h² (f_int(x_k) − K x_k)  for one linearised iteration.
pub fn iterative_rhs(
    mass: &CsMat<f64>,
    stiffness: &CsMat<f64>,
    predicted: &[f64],
    iterate: &[f64],
    internal: &[f64],
    h: f64,
) -> Vec<f64> {
    let h2 = h * h;
    let mut r = spmv(mass, predicted);
    let k_x = spmv(stiffness, iterate);
    for ((ri, &fi), &kxi) in r.iter_mut().zip(internal).zip(&k_x) {
        *ri += h2 * (fi - kxi);
    }
    r
}
