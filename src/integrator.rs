//! Time integrators.
//!
//! Both strategies read the current state through a [`StepContext`] and
//! return the next state in a [`StepOutcome`].  They never touch the
//! simulation directly: the caller commits the outcome only when the whole
//! step succeeded, so a failed factorisation leaves the state as it was.

use crate::assembly::{
    assemble_mass, assemble_stiffness, flatten, iterative_rhs, linear_combination,
    semi_implicit_rhs, total_forces, unflatten,
};
use crate::forces::SpringModel;
use crate::linsolve::{solve_sparse, FactorisationStrategy};
use crate::residual::residual_norm;
use crate::topology::Topology;
use crate::types::{Coupling, IntegratorKind, IterativeSettings, SimError, SimulationConfig, StepReport};
use ndarray::Array2;
use sprs::CsMat;
use std::fmt::Debug;

/// Read-only view of everything a step needs.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub topology: &'a Topology,
    pub model: &'a SpringModel,
    pub masses: &'a [f64],
    /// `N × 3`, refreshed by the external-force hook for the current time.
    pub external: &'a Array2<f64>,
    pub positions: &'a Array2<f64>,
    pub velocities: &'a Array2<f64>,
    pub h: f64,
    pub factorisation: FactorisationStrategy,
    pub regularization: f64,
    /// Applied to the residual vector before its norm is taken; `None`
    /// keeps every component.
    pub residual_map: Option<&'a CsMat<f64>>,
}

/// State produced by a successful step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub positions: Array2<f64>,
    pub velocities: Array2<f64>,
    pub report: StepReport,
}

/// A time-integration scheme operating on the shared simulation state.
pub trait StepStrategy: Debug + Send {
    fn name(&self) -> &str;

    /// Compute the state one timestep ahead of `ctx`.
    fn advance(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, SimError>;
}

/// Build the strategy selected in `config`.
pub fn strategy_for(config: &SimulationConfig) -> Box<dyn StepStrategy> {
    match config.integrator {
        IntegratorKind::SemiImplicit => Box::new(SemiImplicit),
        IntegratorKind::Iterative => Box::new(IterativeMinimization::new(config.iterative.clone())),
    }
}

/// Implicit-Euler predictor  yᵢ = xᵢ + h vᵢ + h² f_ext,ᵢ / mᵢ  (flat 3N).
pub fn predict_positions(ctx: &StepContext<'_>) -> Vec<f64> {
    let h = ctx.h;
    let mut y = Vec::with_capacity(3 * ctx.masses.len());
    for (i, &m) in ctx.masses.iter().enumerate() {
        for d in 0..3 {
            y.push(ctx.positions[[i, d]] + h * ctx.velocities[[i, d]] + h * h * ctx.external[[i, d]] / m);
        }
    }
    y
}

// ─────────────────────────────────────────────────────────────
//  Semi-implicit single solve
// ─────────────────────────────────────────────────────────────

/// Linearise once at the current positions, solve
///
///   (M − h² K) v' = M v + h f
///
/// and move the particles with the new velocity: x' = x + h v'.
/// Stability comes from the implicit velocity solve; there is no
/// re-linearisation within the step.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemiImplicit;

impl StepStrategy for SemiImplicit {
    fn name(&self) -> &str {
        "semi-implicit"
    }

    fn advance(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, SimError> {
        let h = ctx.h;

        // 1. Total force at the current configuration
        let f_int = ctx.model.internal_forces(ctx.topology, ctx.positions)?;
        let f = total_forces(ctx.external, &f_int)?;

        // 2. M and K
        let mass = assemble_mass(ctx.masses);
        let stiffness = assemble_stiffness(ctx.topology, ctx.model, ctx.positions, Coupling::Coupled)?;

        // 3. A = M − h² K,  b = M v + h f
        let a = linear_combination(&mass, 1.0, &stiffness, -h * h)?;
        let b = semi_implicit_rhs(&mass, &flatten(ctx.velocities), &f, h);

        // 4. Solve for v'
        let v_new = solve_sparse(&a, &b, ctx.factorisation, ctx.regularization)?;

        // 5. x' = x + h v'
        let velocities = unflatten(&v_new)?;
        let positions = ctx.positions + &velocities.mapv(|v| v * h);

        Ok(StepOutcome {
            positions,
            velocities,
            report: StepReport {
                iterations: 1,
                residual: None,
                residual_history: Vec::new(),
                converged: true,
            },
        })
    }
}

// ─────────────────────────────────────────────────────────────
//  Iterative minimisation
// ─────────────────────────────────────────────────────────────

/// Fixed-point / quasi-Newton solve of the implicit-Euler equations.
///
/// Starting from the predictor y, each iteration linearises the spring
/// forces around the current iterate xₖ and solves
///
///   (M − h² K(xₖ)) xₖ₊₁ = M y + h² (f_int(xₖ) − K(xₖ) xₖ)
///
/// then evaluates the residual at xₖ₊₁.  There is no line search.  Running
/// out of iterations is not an error; the last iterate is committed with
/// `converged = false`.
#[derive(Debug, Clone, Default)]
pub struct IterativeMinimization {
    pub settings: IterativeSettings,
}

impl IterativeMinimization {
    pub fn new(settings: IterativeSettings) -> Self {
        Self { settings }
    }
}

impl StepStrategy for IterativeMinimization {
    fn name(&self) -> &str {
        "iterative"
    }

    fn advance(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, SimError> {
        let h = ctx.h;
        let h2 = h * h;
        let settings = &self.settings;

        let y = predict_positions(ctx);
        let mass = assemble_mass(ctx.masses);
        let mut x_k = unflatten(&y)?;

        // Spring forces at the current iterate, carried from the residual
        // evaluation into the next linearisation.
        let mut f_int = ctx.model.internal_forces(ctx.topology, &x_k)?;
        let predictor_residual = residual_norm(ctx, &y, Some(&f_int), &y, &x_k)?;
        log::trace!("predictor residual: {predictor_residual:e}");

        let mut history = Vec::with_capacity(settings.max_iterations);
        let mut converged = false;

        for iter in 0..settings.max_iterations {
            let stiffness = assemble_stiffness(ctx.topology, ctx.model, &x_k, settings.coupling)?;

            let coeff = linear_combination(&mass, 1.0, &stiffness, -h2)?;
            let rhs = iterative_rhs(&mass, &stiffness, &y, &flatten(&x_k), &flatten(&f_int), h);

            let x_next = solve_sparse(&coeff, &rhs, ctx.factorisation, ctx.regularization)?;
            x_k = unflatten(&x_next)?;

            f_int = ctx.model.internal_forces(ctx.topology, &x_k)?;
            let residual = residual_norm(ctx, &y, Some(&f_int), &x_next, &x_k)?;
            log::trace!("[{iter}] residual: {residual:e}");
            history.push(residual);

            if residual < settings.tolerance {
                converged = true;
                break;
            }
        }

        if !converged {
            log::warn!(
                "iterative step stopped after {} iterations, residual {:e} > {:e}",
                history.len(),
                history.last().copied().unwrap_or(f64::NAN),
                settings.tolerance,
            );
        }

        let velocities = (&x_k - ctx.positions) / h;

        Ok(StepOutcome {
            positions: x_k,
            velocities,
            report: StepReport {
                iterations: history.len(),
                residual: history.last().copied(),
                residual_history: history,
                converged,
            },
        })
    }
}
