use serde::Deserialize;
use std::fmt;

use crate::linsolve::FactorisationStrategy;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public Rust API returns `Result<T, SimError>`
/// instead of panicking.  The FFI layer translates these into integer
/// return codes via [`SimError::code`].
#[derive(Debug)]
pub enum SimError {
    /// Malformed edge list at initialization (self-loop, out-of-range
    /// index, duplicate edge, zero-length edge).
    InvalidTopology { edge: usize, reason: &'static str },
    /// Force or Jacobian requested for a pair that is not an edge.
    /// Signals a programming error in the caller, not a runtime state.
    UnknownEdge { i: usize, j: usize },
    /// Two connected particles coincide; the spring direction is undefined.
    DegenerateGeometry { i: usize, j: usize, distance: f64 },
    /// Sparse factorisation failed (singular / not-SPD matrix).
    Linalg(sprs::errors::LinalgError),
    /// Linear solve produced no usable solution.
    SolverFailure(String),
    /// Shape mismatch in input data.
    Shape(String),
    /// Rejected configuration value.
    InvalidConfig(String),
    /// `step` called before `initialize`.
    NotInitialized,
}

impl SimError {
    /// Stable integer code used across the C ABI.  `0` is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidTopology { .. } => 1,
            Self::UnknownEdge { .. } => 2,
            Self::DegenerateGeometry { .. } => 3,
            Self::Linalg(_) | Self::SolverFailure(_) => 4,
            Self::Shape(_) => 5,
            Self::InvalidConfig(_) => 6,
            Self::NotInitialized => 7,
        }
    }

    /// True for the failures a caller can react to by shrinking `h` or `k`.
    pub fn is_solver_failure(&self) -> bool {
        matches!(self, Self::Linalg(_) | Self::SolverFailure(_))
    }
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTopology { edge, reason } =>
                write!(f, "invalid topology: edge {edge}: {reason}"),
            Self::UnknownEdge { i, j } =>
                write!(f, "unknown edge ({i},{j}) not in topology index"),
            Self::DegenerateGeometry { i, j, distance } =>
                write!(f, "degenerate geometry: particles {i} and {j} are {distance:e} apart"),
            Self::Linalg(e) => write!(f, "solver failure: {e}"),
            Self::SolverFailure(msg) => write!(f, "solver failure: {msg}"),
            Self::Shape(msg) => write!(f, "shape error: {msg}"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::NotInitialized =>
                write!(f, "simulation not initialized (call initialize first)"),
        }
    }
}

impl std::error::Error for SimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Linalg(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sprs::errors::LinalgError> for SimError {
    fn from(e: sprs::errors::LinalgError) -> Self {
        Self::Linalg(e)
    }
}

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

/// Below this separation a spring has no usable direction.
pub const DEGENERATE_DISTANCE: f64 = 1e-12;

pub const DEFAULT_MASS: f64 = 1.0;
pub const DEFAULT_RESIDUAL_TOLERANCE: f64 = 1e-3;
pub const DEFAULT_MAX_ITERATIONS: usize = 50;

// ─────────────────────────────────────────────────────────────
//  Integrator selection
// ─────────────────────────────────────────────────────────────

/// Which step strategy a [`Simulation`](crate::simulation::Simulation) builds
/// from its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum IntegratorKind {
    /// One linearisation per step, implicit velocity solve.
    #[default]
    #[serde(rename = "semi_implicit")]
    SemiImplicit,
    /// Re-linearised fixed-point iteration with residual-based stopping.
    #[serde(rename = "iterative")]
    Iterative,
}

/// Which Jacobian blocks an assembly writes for each edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Coupling {
    /// (i,i), (j,j), (i,j) and (j,i).
    #[default]
    #[serde(rename = "coupled")]
    Coupled,
    /// (i,i) and (j,j) only.
    #[serde(rename = "block_diagonal")]
    BlockDiagonal,
}

/// Which residual components the iterative integrator's stopping test sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ResidualSelection {
    /// All 3N components.
    #[default]
    #[serde(rename = "all")]
    AllComponents,
    /// The first N components of the flattened 3N vector only.
    #[serde(rename = "leading")]
    Leading,
}

// ─────────────────────────────────────────────────────────────
//  Solver / simulation options
// ─────────────────────────────────────────────────────────────

/// Settings of the iterative integrator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IterativeSettings {
    /// Stop once the residual norm drops below this value.
    pub tolerance: f64,
    /// Linearised solves per step before giving up on convergence.
    pub max_iterations: usize,
    /// Jacobian blocks used in the coefficient matrix.
    pub coupling: Coupling,
}

impl Default for IterativeSettings {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_RESIDUAL_TOLERANCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            coupling: Coupling::BlockDiagonal,
        }
    }
}

/// Everything needed to run a simulation apart from the mesh itself.
///
/// `stiffness` is one coefficient shared by every spring; per-edge
/// stiffness is not supported.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub timestep: f64,
    pub stiffness: f64,
    pub default_mass: f64,
    pub integrator: IntegratorKind,
    pub iterative: IterativeSettings,
    pub factorisation: FactorisationStrategy,
    /// Added to every diagonal entry of the system matrix before factorising.
    /// The step then solves the shifted system, so any value above zero
    /// damps the motion as well as stabilising the factorisation.
    pub regularization: f64,
    pub residual_selection: ResidualSelection,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            timestep: 0.01,
            stiffness: 10.0,
            default_mass: DEFAULT_MASS,
            integrator: IntegratorKind::default(),
            iterative: IterativeSettings::default(),
            factorisation: FactorisationStrategy::default(),
            regularization: 0.0,
            residual_selection: ResidualSelection::default(),
        }
    }
}

impl SimulationConfig {
    /// Reject values that would make every step meaningless.
    pub fn validate(&self) -> Result<(), SimError> {
        if !(self.timestep.is_finite() && self.timestep > 0.0) {
            return Err(SimError::InvalidConfig(format!("timestep must be positive, got {}", self.timestep)));
        }
        if !(self.stiffness.is_finite() && self.stiffness >= 0.0) {
            return Err(SimError::InvalidConfig(format!("stiffness must be non-negative, got {}", self.stiffness)));
        }
        if !(self.default_mass.is_finite() && self.default_mass > 0.0) {
            return Err(SimError::InvalidConfig(format!("mass must be positive, got {}", self.default_mass)));
        }
        if !(self.regularization.is_finite() && self.regularization >= 0.0) {
            return Err(SimError::InvalidConfig(format!(
                "regularization must be non-negative, got {}",
                self.regularization
            )));
        }
        if !(self.iterative.tolerance.is_finite() && self.iterative.tolerance > 0.0) {
            return Err(SimError::InvalidConfig(format!(
                "residual tolerance must be positive, got {}",
                self.iterative.tolerance
            )));
        }
        if self.iterative.max_iterations == 0 {
            return Err(SimError::InvalidConfig("max_iterations must be at least 1".into()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Step report  (returned from every successful step)
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// Linear solves performed (always 1 for the semi-implicit path).
    pub iterations: usize,
    /// Residual norm of the committed state, if the strategy tracks one.
    pub residual: Option<f64>,
    /// Residual after each linear solve, in order.
    pub residual_history: Vec<f64>,
    /// False only when the iterative path ran out of iterations.
    pub converged: bool,
}
