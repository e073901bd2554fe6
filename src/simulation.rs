//! The simulation object: owns particle and topology state, runs the
//! external-force hook and commits the outcome of each step.

use crate::assembly::residual_map;
use crate::forces::{ExternalForce, NoExternalForce, SpringModel};
use crate::integrator::{strategy_for, StepContext, StepStrategy};
use crate::topology::Topology;
use crate::types::{SimError, SimulationConfig, StepReport};
use ndarray::Array2;
use sprs::CsMat;

/// Per-run state, present between `initialize` and `reset`.
#[derive(Debug, Clone)]
struct State {
    topology: Topology,
    positions: Array2<f64>,
    velocities: Array2<f64>,
    masses: Vec<f64>,
    external: Array2<f64>,
    residual_map: Option<CsMat<f64>>,
}

/// A mass-spring system advanced with implicit time integration.
///
/// ```text
/// let mut sim = Simulation::new(config, Box::new(Gravity::earth()));
/// sim.initialize(&positions, &edges, h, k)?;
/// loop {
///     sim.step()?;
///     render(sim.positions());
/// }
/// ```
pub struct Simulation {
    config: SimulationConfig,
    strategy: Box<dyn StepStrategy>,
    external: Box<dyn ExternalForce>,
    state: Option<State>,
    time: f64,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("config", &self.config)
            .field("strategy", &self.strategy.name())
            .field("num_particles", &self.num_particles())
            .field("time", &self.time)
            .finish()
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new(SimulationConfig::default(), Box::new(NoExternalForce))
    }
}

impl Simulation {
    /// Empty simulation using the integrator selected in `config`.
    pub fn new(config: SimulationConfig, external: Box<dyn ExternalForce>) -> Self {
        let strategy = strategy_for(&config);
        Self::with_strategy(config, strategy, external)
    }

    /// Empty simulation with an explicitly supplied step strategy.
    pub fn with_strategy(
        config: SimulationConfig,
        strategy: Box<dyn StepStrategy>,
        external: Box<dyn ExternalForce>,
    ) -> Self {
        Self {
            config,
            strategy,
            external,
            state: None,
            time: 0.0,
        }
    }

    /// Replace the external-force provider.  Takes effect after the next step
    /// (or the next `initialize`).
    pub fn set_external_force(&mut self, external: Box<dyn ExternalForce>) {
        self.external = external;
    }

    // ─────────────────────────────────────────────────────────
    //  Lifecycle
    // ─────────────────────────────────────────────────────────

    /// Set up a run from vertex positions (`N × 3`) and an edge list.
    ///
    /// Builds the topology, zeroes velocities, assigns the default mass,
    /// resets the clock and runs the external-force hook once.  Everything is
    /// validated first; on error the previous state is kept.
    pub fn initialize(
        &mut self,
        positions: &Array2<f64>,
        edges: &[(usize, usize)],
        timestep: f64,
        stiffness: f64,
    ) -> Result<(), SimError> {
        let mut config = self.config.clone();
        config.timestep = timestep;
        config.stiffness = stiffness;
        config.validate()?;

        if positions.ncols() != 3 {
            return Err(SimError::Shape(format!(
                "positions must be N x 3, got {:?}",
                positions.dim()
            )));
        }
        if positions.iter().any(|v| !v.is_finite()) {
            return Err(SimError::Shape("positions contain non-finite values".into()));
        }

        let topology = Topology::build(edges, positions)?;
        let n = positions.nrows();
        let masses = vec![config.default_mass; n];
        let external = Self::evaluate_external(self.external.as_mut(), 0.0, positions, &masses)?;

        log::debug!(
            "initialized {} particles, {} springs, h={}, k={}",
            n,
            topology.num_edges(),
            config.timestep,
            config.stiffness
        );

        self.config = config;
        self.state = Some(State {
            topology,
            positions: positions.to_owned(),
            velocities: Array2::zeros((n, 3)),
            masses,
            external,
            residual_map: residual_map(n, self.config.residual_selection),
        });
        self.time = 0.0;
        Ok(())
    }

    /// Convenience form of [`initialize`](Self::initialize) taking point triples.
    pub fn initialize_from_points(
        &mut self,
        points: &[[f64; 3]],
        edges: &[(usize, usize)],
        timestep: f64,
        stiffness: f64,
    ) -> Result<(), SimError> {
        let flat: Vec<f64> = points.iter().flatten().copied().collect();
        let positions = Array2::from_shape_vec((points.len(), 3), flat)
            .map_err(|e| SimError::Shape(e.to_string()))?;
        self.initialize(&positions, edges, timestep, stiffness)
    }

    /// Drop all particle and topology state.  Configuration and the
    /// external-force provider are kept for the next `initialize`.
    pub fn reset(&mut self) {
        self.state = None;
        self.time = 0.0;
    }

    /// Advance by one timestep with the selected strategy.
    ///
    /// On success positions and velocities are replaced, the clock advances
    /// by `h` and the external-force hook runs for the new time.  On error
    /// nothing changes.
    pub fn step(&mut self) -> Result<StepReport, SimError> {
        let state = self.state.as_ref().ok_or(SimError::NotInitialized)?;
        let model = SpringModel::new(self.config.stiffness);

        let ctx = StepContext {
            topology: &state.topology,
            model: &model,
            masses: &state.masses,
            external: &state.external,
            positions: &state.positions,
            velocities: &state.velocities,
            h: self.config.timestep,
            factorisation: self.config.factorisation,
            regularization: self.config.regularization,
            residual_map: state.residual_map.as_ref(),
        };

        let outcome = self.strategy.advance(&ctx)?;
        let next_time = self.time + self.config.timestep;
        let external = Self::evaluate_external(
            self.external.as_mut(),
            next_time,
            &outcome.positions,
            &state.masses,
        )?;

        log::debug!(
            "{} step t={:.6} iterations={} residual={:?}",
            self.strategy.name(),
            next_time,
            outcome.report.iterations,
            outcome.report.residual
        );

        if let Some(state) = self.state.as_mut() {
            state.positions = outcome.positions;
            state.velocities = outcome.velocities;
            state.external = external;
        }
        self.time = next_time;
        Ok(outcome.report)
    }

    fn evaluate_external(
        hook: &mut dyn ExternalForce,
        time: f64,
        positions: &Array2<f64>,
        masses: &[f64],
    ) -> Result<Array2<f64>, SimError> {
        let forces = hook.compute(time, positions, masses);
        if forces.dim() != (positions.nrows(), 3) {
            return Err(SimError::Shape(format!(
                "external force hook returned {:?}, expected ({}, 3)",
                forces.dim(),
                positions.nrows()
            )));
        }
        if forces.iter().any(|v| !v.is_finite()) {
            return Err(SimError::Shape("external force hook returned non-finite values".into()));
        }
        Ok(forces)
    }

    // ─────────────────────────────────────────────────────────
    //  Host edits between steps
    // ─────────────────────────────────────────────────────────

    /// Move particle `i`.  Rest lengths are not affected.
    pub fn set_position(&mut self, i: usize, p: [f64; 3]) -> Result<(), SimError> {
        let state = self.state.as_mut().ok_or(SimError::NotInitialized)?;
        write_row(&mut state.positions, i, p)
    }

    pub fn set_velocity(&mut self, i: usize, v: [f64; 3]) -> Result<(), SimError> {
        let state = self.state.as_mut().ok_or(SimError::NotInitialized)?;
        write_row(&mut state.velocities, i, v)
    }

    // ─────────────────────────────────────────────────────────
    //  Read accessors
    // ─────────────────────────────────────────────────────────

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn num_particles(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.positions.nrows())
    }

    /// Current positions (`N × 3`); `None` before `initialize`.
    pub fn positions(&self) -> Option<&Array2<f64>> {
        self.state.as_ref().map(|s| &s.positions)
    }

    pub fn velocities(&self) -> Option<&Array2<f64>> {
        self.state.as_ref().map(|s| &s.velocities)
    }

    pub fn masses(&self) -> Option<&[f64]> {
        self.state.as_ref().map(|s| s.masses.as_slice())
    }

    /// External forces that the next step will use.
    pub fn external_forces(&self) -> Option<&Array2<f64>> {
        self.state.as_ref().map(|s| &s.external)
    }

    pub fn topology(&self) -> Option<&Topology> {
        self.state.as_ref().map(|s| &s.topology)
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn timestep(&self) -> f64 {
        self.config.timestep
    }

    pub fn stiffness(&self) -> f64 {
        self.config.stiffness
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }
}

fn write_row(arr: &mut Array2<f64>, i: usize, value: [f64; 3]) -> Result<(), SimError> {
    if i >= arr.nrows() {
        return Err(SimError::Shape(format!("particle {i} out of range (N = {})", arr.nrows())));
    }
    if value.iter().any(|v| !v.is_finite()) {
        return Err(SimError::Shape(format!("non-finite value for particle {i}")));
    }
    for d in 0..3 {
        arr[[i, d]] = value[d];
    }
    Ok(())
}
