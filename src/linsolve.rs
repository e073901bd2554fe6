//! Sparse direct solve of `A x = b` for the integrators.
//!
//! `A` is assembled fresh every step, so every solve builds a new
//! factorisation; nothing is cached between steps.

use crate::types::SimError;
use serde::Deserialize;
use sprs::{CsMat, FillInReduction, SymmetryCheck, TriMat};
use sprs_ldl::{Ldl, LdlNumeric};

// ─────────────────────────────────────────────────────────────
//  Factorisation strategy
// ─────────────────────────────────────────────────────────────

/// How the symmetric system matrix `A = M − h² K` is factorised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum FactorisationStrategy {
    /// Symmetric indefinite LDLᵀ: no sign constraint on D.
    /// Compressed springs can make `A` indefinite, so this is the default.
    #[default]
    #[serde(rename = "ldl")]
    Ldl,
    /// LDLᵀ that additionally rejects any D ≤ 0 (A must be SPD).
    #[serde(rename = "cholesky")]
    Cholesky,
}

/// Holds a numeric LDLᵀ factorisation of one system matrix.
pub struct Factorization {
    ldl: LdlNumeric<f64, usize>,
    strategy: FactorisationStrategy,
}

impl std::fmt::Debug for Factorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Factorization::{:?}(n = {})", self.strategy, self.ldl.d().len())
    }
}

impl Factorization {
    /// Factorise `a` (square, symmetric, CSC).
    pub fn new(a: sprs::CsMatView<f64>, strategy: FactorisationStrategy) -> Result<Self, SimError> {
        let ldl = Ldl::new()
            .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
            .check_symmetry(SymmetryCheck::DontCheckSymmetry)
            .numeric(a)?;

        for (i, &di) in ldl.d().iter().enumerate() {
            if !di.is_finite() {
                return Err(SimError::SolverFailure(format!("non-finite pivot at {i}")));
            }
            if di == 0.0 {
                return Err(SimError::SolverFailure(format!("zero pivot at {i} (singular system)")));
            }
            if strategy == FactorisationStrategy::Cholesky && di <= 0.0 {
                return Err(sprs::errors::LinalgError::SingularMatrix(
                    sprs::errors::SingularMatrixInfo {
                        index: i,
                        reason: "D <= 0 in Cholesky factorization (not SPD)",
                    },
                )
                .into());
            }
        }
        Ok(Self { ldl, strategy })
    }

    /// Solve A x = rhs using the stored factorisation.
    pub fn solve(&self, rhs: &[f64]) -> Vec<f64> {
        self.ldl.solve(rhs)
    }

    pub fn strategy(&self) -> FactorisationStrategy {
        self.strategy
    }
}

// ─────────────────────────────────────────────────────────────
//  One-shot solve
// ─────────────────────────────────────────────────────────────

/// Factorise `a` (+ `regularization` on the diagonal) and solve for `rhs`.
///
/// With `regularization > 0` the result solves (A + αI) x = rhs, not the
/// original system.
///
/// Any failure, including a solution containing NaN or infinity, is reported
/// as a solver failure so that the caller can leave its state untouched.
pub fn solve_sparse(
    a: &CsMat<f64>,
    rhs: &[f64],
    strategy: FactorisationStrategy,
    regularization: f64,
) -> Result<Vec<f64>, SimError> {
    let n = a.rows();
    if a.cols() != n || rhs.len() != n {
        return Err(SimError::Shape(format!(
            "system is {}x{} but rhs has length {}",
            n,
            a.cols(),
            rhs.len()
        )));
    }
    if n == 0 {
        return Ok(Vec::new());
    }

    let regularized;
    let a_csc = if regularization > 0.0 {
        regularized = add_to_diagonal(a, regularization);
        regularized.view()
    } else {
        a.view()
    };

    let factorization = Factorization::new(a_csc, strategy)?;
    let x = factorization.solve(rhs);

    if let Some(i) = x.iter().position(|v| !v.is_finite()) {
        return Err(SimError::SolverFailure(format!("non-finite solution component {i}")));
    }
    Ok(x)
}

/// A + αI, keeping A's pattern plus the full diagonal.
fn add_to_diagonal(a: &CsMat<f64>, alpha: f64) -> CsMat<f64> {
    let n = a.rows();
    let mut tri = TriMat::with_capacity((n, n), a.nnz() + n);
    for (&v, (row, col)) in a.iter() {
        tri.add_triplet(row, col, v);
    }
    for i in 0..n {
        tri.add_triplet(i, i, alpha);
    }
    tri.to_csc()
}
