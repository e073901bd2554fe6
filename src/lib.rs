//! **springsim**: implicit mass-spring simulation with sparse direct solves.
//!
//! Point masses joined by linear springs are advanced in time by one of two
//! implicit integrators:
//!
//! 1. **Topology** (`topology`): rest lengths and adjacency, built once.
//! 2. **Forces** (`forces`): spring force / Jacobian blocks, external-force hook.
//! 3. **Assembly** (`assembly`): sparse M, K and right-hand sides.
//! 4. **Linear solve** (`linsolve`): sparse LDLᵀ via `sprs-ldl`.
//! 5. **Integrators** (`integrator`): semi-implicit single solve and an
//!    iterative re-linearised solve, behind the `StepStrategy` trait.
//! 6. **Residual** (`residual`): equation-of-motion residual norm.
//! 7. **Simulation** (`simulation`): state ownership and the host-facing API.
//! 8. **FFI** (`ffi`): C-compatible API for the mesh-editing host.
//!
//! All springs share one stiffness coefficient.

pub mod types;
pub mod topology;
pub mod forces;
pub mod assembly;
pub mod linsolve;
pub mod residual;
pub mod integrator;
pub mod simulation;
pub mod ffi;

pub use forces::{ExternalForce, Gravity, NoExternalForce, SpringModel};
pub use integrator::{IterativeMinimization, SemiImplicit, StepStrategy};
pub use simulation::Simulation;
pub use topology::Topology;
pub use types::{SimError, SimulationConfig, StepReport};
