//! Spring force model and the external-force hook.
//!
//! For an edge (i, j) with rest length l, stiffness k and d = |xᵢ − xⱼ|:
//!
//!   fᵢ        = k (d − l) / d · (xⱼ − xᵢ)
//!   ∂fᵢ/∂xᵢ   = k (l/d − 1) I₃ − k l / d³ · (xᵢ − xⱼ)(xᵢ − xⱼ)ᵀ
//!
//! The Jacobian block is symmetric, ∂fⱼ/∂xⱼ = ∂fᵢ/∂xᵢ and
//! ∂fᵢ/∂xⱼ = −∂fᵢ/∂xᵢ.  The assembler relies on this to mirror a single
//! block into all four (i,i), (j,j), (i,j), (j,i) positions.

use crate::topology::Topology;
use crate::types::{SimError, DEGENERATE_DISTANCE};
use nalgebra::{Matrix3, Vector3};
use ndarray::Array2;

/// Row `i` of an `N × 3` array as a 3-vector.
#[inline]
pub fn particle(arr: &Array2<f64>, i: usize) -> Vector3<f64> {
    Vector3::new(arr[[i, 0]], arr[[i, 1]], arr[[i, 2]])
}

// ─────────────────────────────────────────────────────────────
//  Internal (spring) forces
// ─────────────────────────────────────────────────────────────

/// Linear springs sharing one global stiffness coefficient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpringModel {
    pub stiffness: f64,
}

impl SpringModel {
    pub fn new(stiffness: f64) -> Self {
        Self { stiffness }
    }

    /// Current edge vector xᵢ − xⱼ, its length and the rest length.
    fn separation(
        &self,
        topology: &Topology,
        positions: &Array2<f64>,
        i: usize,
        j: usize,
    ) -> Result<(Vector3<f64>, f64, f64), SimError> {
        let rest = topology.rest_length(i, j)?;
        let diff = particle(positions, i) - particle(positions, j);
        let dist = diff.norm();
        if !dist.is_finite() || dist < DEGENERATE_DISTANCE {
            return Err(SimError::DegenerateGeometry { i, j, distance: dist });
        }
        Ok((diff, dist, rest))
    }

    /// Force exerted on particle `i` by the spring (i, j).
    pub fn force(
        &self,
        topology: &Topology,
        positions: &Array2<f64>,
        i: usize,
        j: usize,
    ) -> Result<Vector3<f64>, SimError> {
        let (diff, dist, rest) = self.separation(topology, positions, i, j)?;
        // diff points from j to i, the force pulls i towards j when stretched
        Ok(-(self.stiffness * (dist - rest) / dist) * diff)
    }

    /// ∂fᵢ/∂xᵢ for the spring (i, j), evaluated at `positions`.
    pub fn jacobian(
        &self,
        topology: &Topology,
        positions: &Array2<f64>,
        i: usize,
        j: usize,
    ) -> Result<Matrix3<f64>, SimError> {
        let (diff, dist, rest) = self.separation(topology, positions, i, j)?;
        let k = self.stiffness;
        Ok(Matrix3::identity() * (k * (rest / dist - 1.0))
            - (diff * diff.transpose()) * (k * rest / (dist * dist * dist)))
    }

    /// Sum of spring forces on every particle (`N × 3`).
    pub fn internal_forces(
        &self,
        topology: &Topology,
        positions: &Array2<f64>,
    ) -> Result<Array2<f64>, SimError> {
        let n = positions.nrows();
        let mut out = Array2::zeros((n, 3));
        for i in 0..n {
            let mut total = Vector3::zeros();
            for &j in topology.neighbors(i) {
                total += self.force(topology, positions, i, j)?;
            }
            for d in 0..3 {
                out[[i, d]] = total[d];
            }
        }
        Ok(out)
    }
}

// ─────────────────────────────────────────────────────────────
//  External forces  (extension point)
// ─────────────────────────────────────────────────────────────

/// Supplies one external force per particle.
///
/// Called once at initialization and once after every successful step, so
/// the forces in use always match the simulation clock.  The result must
/// be `N × 3`.
pub trait ExternalForce {
    fn compute(&mut self, time: f64, positions: &Array2<f64>, masses: &[f64]) -> Array2<f64>;
}

impl<F> ExternalForce for F
where
    F: FnMut(f64, &Array2<f64>, &[f64]) -> Array2<f64>,
{
    fn compute(&mut self, time: f64, positions: &Array2<f64>, masses: &[f64]) -> Array2<f64> {
        self(time, positions, masses)
    }
}

/// No external forces.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExternalForce;

impl ExternalForce for NoExternalForce {
    fn compute(&mut self, _time: f64, positions: &Array2<f64>, _masses: &[f64]) -> Array2<f64> {
        Array2::zeros((positions.nrows(), 3))
    }
}

/// Uniform acceleration field: fᵢ = mᵢ g.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gravity {
    pub acceleration: [f64; 3],
}

impl Gravity {
    /// Standard gravity along −y.
    pub fn earth() -> Self {
        Self { acceleration: [0.0, -9.81, 0.0] }
    }
}

impl ExternalForce for Gravity {
    fn compute(&mut self, _time: f64, positions: &Array2<f64>, masses: &[f64]) -> Array2<f64> {
        let mut out = Array2::zeros((positions.nrows(), 3));
        for (i, &m) in masses.iter().enumerate().take(positions.nrows()) {
            for d in 0..3 {
                out[[i, d]] = m * self.acceleration[d];
            }
        }
        out
    }
}
