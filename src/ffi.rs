//! C-compatible FFI for the mesh-editing host.
//!
//! All functions are `#[no_mangle] extern "C"` so they can be called from
//! C or C++ (or C# via P/Invoke).
//!
//! Memory convention:
//!   - Caller allocates flat arrays and passes pointers + lengths.
//!   - Positions are `num_particles × 3` row-major, edges are
//!     `num_edges × 2` row-major.
//!   - The opaque `SimHandle` is created by Rust and freed by Rust via
//!     `springsim_free`.
//!   - Fallible calls return 0 on success or `SimError::code()`.

use crate::forces::{Gravity, NoExternalForce};
use crate::simulation::Simulation;
use crate::types::{IntegratorKind, SimError, SimulationConfig};
use ndarray::Array2;
use std::cell::RefCell;
use std::slice;

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Remember `e` for `springsim_last_error` and return its code.
fn record(e: SimError) -> i32 {
    let code = e.code();
    LAST_ERROR.with(|msg| *msg.borrow_mut() = e.to_string());
    code
}

/// Handle returned by `springsim_create`.
pub struct SimHandle {
    pub sim: Simulation,
}

/// Reported when a handle argument is null.
pub const NULL_HANDLE: i32 = -1;

/// Integrator selector: 0 = semi-implicit, 1 = iterative.
fn integrator_from_code(code: u32) -> Result<IntegratorKind, SimError> {
    match code {
        0 => Ok(IntegratorKind::SemiImplicit),
        1 => Ok(IntegratorKind::Iterative),
        other => Err(SimError::InvalidConfig(format!("unknown integrator code {other}"))),
    }
}

fn code_of(result: Result<(), SimError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => record(e),
    }
}

/// Copy the caller's flat arrays and hand them to `Simulation::initialize`.
unsafe fn initialize_from_raw(
    sim: &mut Simulation,
    positions: *const f64,
    num_particles: usize,
    edges: *const usize,
    num_edges: usize,
    timestep: f64,
    stiffness: f64,
) -> Result<(), SimError> {
    let pos_slice = if num_particles == 0 { &[][..] } else { slice::from_raw_parts(positions, num_particles * 3) };
    let edge_slice = if num_edges == 0 { &[][..] } else { slice::from_raw_parts(edges, num_edges * 2) };

    let pos = Array2::from_shape_vec((num_particles, 3), pos_slice.to_vec())
        .map_err(|e| SimError::Shape(e.to_string()))?;
    let edge_list: Vec<(usize, usize)> = edge_slice.chunks_exact(2).map(|e| (e[0], e[1])).collect();
    sim.initialize(&pos, &edge_list, timestep, stiffness)
}

// ─────────────────────────────────────────────────────────────
//  Construction
// ─────────────────────────────────────────────────────────────

/// Create and initialize a simulation.
///
/// Returns null on failure; if `out_code` is non-null the error code is
/// written there (0 on success).
///
/// # Safety
/// `positions` must be valid for `num_particles * 3` reads, `edges` for
/// `num_edges * 2` reads.  `out_code` may be null.
#[no_mangle]
pub unsafe extern "C" fn springsim_create(
    positions: *const f64,
    num_particles: usize,
    edges: *const usize,
    num_edges: usize,
    timestep: f64,
    stiffness: f64,
    integrator: u32,
    out_code: *mut i32,
) -> *mut SimHandle {
    let result = integrator_from_code(integrator).and_then(|kind| {
        let config = SimulationConfig {
            integrator: kind,
            ..SimulationConfig::default()
        };
        let mut sim = Simulation::new(config, Box::new(NoExternalForce));
        initialize_from_raw(&mut sim, positions, num_particles, edges, num_edges, timestep, stiffness)?;
        Ok(sim)
    });

    match result {
        Ok(sim) => {
            if !out_code.is_null() {
                *out_code = 0;
            }
            Box::into_raw(Box::new(SimHandle { sim }))
        }
        Err(e) => {
            let code = record(e);
            if !out_code.is_null() {
                *out_code = code;
            }
            std::ptr::null_mut()
        }
    }
}

/// Re-initialize an existing handle with a new mesh (typically after
/// `springsim_reset`).  The integrator and external forces are kept.  On
/// error the previous state is left in place.
///
/// # Safety
/// Valid handle; array requirements as for `springsim_create`.
#[no_mangle]
pub unsafe extern "C" fn springsim_initialize(
    handle: *mut SimHandle,
    positions: *const f64,
    num_particles: usize,
    edges: *const usize,
    num_edges: usize,
    timestep: f64,
    stiffness: f64,
) -> i32 {
    let Some(h) = handle.as_mut() else {
        return NULL_HANDLE;
    };
    code_of(initialize_from_raw(&mut h.sim, positions, num_particles, edges, num_edges, timestep, stiffness))
}

/// Free a handle.
///
/// # Safety
/// `handle` must be a pointer returned by `springsim_create`, or null.
#[no_mangle]
pub unsafe extern "C" fn springsim_free(handle: *mut SimHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

// ─────────────────────────────────────────────────────────────
//  Stepping
// ─────────────────────────────────────────────────────────────

/// Advance one timestep.  `out_iterations` / `out_converged` may be null.
///
/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn springsim_step(
    handle: *mut SimHandle,
    out_iterations: *mut usize,
    out_converged: *mut bool,
) -> i32 {
    let Some(h) = handle.as_mut() else {
        return NULL_HANDLE;
    };
    match h.sim.step() {
        Ok(report) => {
            if !out_iterations.is_null() {
                *out_iterations = report.iterations;
            }
            if !out_converged.is_null() {
                *out_converged = report.converged;
            }
            0
        }
        Err(e) => record(e),
    }
}

/// Clear all particle state.  Further steps fail until
/// `springsim_initialize` is called again.
///
/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn springsim_reset(handle: *mut SimHandle) -> i32 {
    let Some(h) = handle.as_mut() else {
        return NULL_HANDLE;
    };
    h.sim.reset();
    0
}

/// Install a uniform gravity field (all zeros turns external forces off).
///
/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn springsim_set_gravity(handle: *mut SimHandle, gx: f64, gy: f64, gz: f64) -> i32 {
    let Some(h) = handle.as_mut() else {
        return NULL_HANDLE;
    };
    if gx == 0.0 && gy == 0.0 && gz == 0.0 {
        h.sim.set_external_force(Box::new(NoExternalForce));
    } else {
        h.sim.set_external_force(Box::new(Gravity { acceleration: [gx, gy, gz] }));
    }
    0
}

/// Move one particle (e.g. a vertex dragged in the editor).
///
/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn springsim_set_position(
    handle: *mut SimHandle,
    index: usize,
    x: f64,
    y: f64,
    z: f64,
) -> i32 {
    let Some(h) = handle.as_mut() else {
        return NULL_HANDLE;
    };
    code_of(h.sim.set_position(index, [x, y, z]))
}

// ─────────────────────────────────────────────────────────────
//  Read back
// ─────────────────────────────────────────────────────────────

unsafe fn copy_out(src: Option<&Array2<f64>>, out: *mut f64, len: usize) -> i32 {
    let Some(src) = src else {
        return record(SimError::NotInitialized);
    };
    if len != src.len() {
        return record(SimError::Shape(format!("output buffer has {len} slots, need {}", src.len())));
    }
    if len == 0 {
        return 0;
    }
    let dst = slice::from_raw_parts_mut(out, len);
    for i in 0..src.nrows() {
        for d in 0..3 {
            dst[i * 3 + d] = src[[i, d]];
        }
    }
    0
}

/// Copy positions into `out` (`len` must equal `num_particles * 3`).
///
/// # Safety
/// Valid handle, `out` valid for `len` writes.
#[no_mangle]
pub unsafe extern "C" fn springsim_positions(handle: *const SimHandle, out: *mut f64, len: usize) -> i32 {
    let Some(h) = handle.as_ref() else {
        return NULL_HANDLE;
    };
    copy_out(h.sim.positions(), out, len)
}

/// Copy velocities into `out` (`len` must equal `num_particles * 3`).
///
/// # Safety
/// Valid handle, `out` valid for `len` writes.
#[no_mangle]
pub unsafe extern "C" fn springsim_velocities(handle: *const SimHandle, out: *mut f64, len: usize) -> i32 {
    let Some(h) = handle.as_ref() else {
        return NULL_HANDLE;
    };
    copy_out(h.sim.velocities(), out, len)
}

/// Simulation clock.  NaN for a null handle.
///
/// # Safety
/// Valid handle or null.
#[no_mangle]
pub unsafe extern "C" fn springsim_time(handle: *const SimHandle) -> f64 {
    handle.as_ref().map_or(f64::NAN, |h| h.sim.time())
}

/// Number of particles (0 after reset or for a null handle).
///
/// # Safety
/// Valid handle or null.
#[no_mangle]
pub unsafe extern "C" fn springsim_num_particles(handle: *const SimHandle) -> usize {
    handle.as_ref().map_or(0, |h| h.sim.num_particles())
}

/// Copy the message of the last error on this thread into `buf`
/// (UTF-8, not NUL-terminated, truncated to `len`).
///
/// Returns the number of bytes written, 0 if no error has been recorded.
///
/// # Safety
/// `buf` must be valid for `len` writes.
#[no_mangle]
pub unsafe extern "C" fn springsim_last_error(buf: *mut u8, len: usize) -> i32 {
    LAST_ERROR.with(|msg| {
        let msg = msg.borrow();
        let n = msg.len().min(len);
        if n == 0 || buf.is_null() {
            return 0;
        }
        slice::from_raw_parts_mut(buf, n).copy_from_slice(&msg.as_bytes()[..n]);
        n as i32
    })
}
