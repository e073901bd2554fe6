//! Topology index: rest lengths keyed by canonical vertex pair, plus an
//! adjacency list built once from the edge list.

use crate::types::SimError;
use ndarray::Array2;
use std::collections::HashMap;

/// Canonical `(min, max)` form of an unordered pair.
#[inline]
pub fn canonical(i: usize, j: usize) -> (usize, usize) {
    if i < j { (i, j) } else { (j, i) }
}

/// Connectivity and rest state of the spring network.
///
/// Immutable after [`Topology::build`]: rest lengths stay fixed for the
/// lifetime of a run even as particles move.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    num_particles: usize,
    /// Canonical edges in input order.
    edges: Vec<(usize, usize)>,
    rest_lengths: HashMap<(usize, usize), f64>,
    /// For each particle, the particles it shares an edge with.
    adjacency: Vec<Vec<usize>>,
}

impl Topology {
    /// Build the index from an edge list and the initial positions (`N × 3`).
    ///
    /// Every edge is validated before anything is stored.
    pub fn build(edges: &[(usize, usize)], positions: &Array2<f64>) -> Result<Self, SimError> {
        if positions.ncols() != 3 {
            return Err(SimError::Shape(format!(
                "positions must be N x 3, got {} columns",
                positions.ncols()
            )));
        }
        let n = positions.nrows();

        let mut canonical_edges = Vec::with_capacity(edges.len());
        let mut rest_lengths = HashMap::with_capacity(edges.len());
        let mut adjacency = vec![Vec::new(); n];

        for (e, &(a, b)) in edges.iter().enumerate() {
            if a == b {
                return Err(SimError::InvalidTopology { edge: e, reason: "self-loop" });
            }
            if a >= n || b >= n {
                return Err(SimError::InvalidTopology { edge: e, reason: "particle index out of range" });
            }
            let key = canonical(a, b);
            if rest_lengths.contains_key(&key) {
                return Err(SimError::InvalidTopology { edge: e, reason: "duplicate edge" });
            }

            let mut len2 = 0.0;
            for d in 0..3 {
                let dx = positions[[a, d]] - positions[[b, d]];
                len2 += dx * dx;
            }
            let len = len2.sqrt();
            if !(len.is_finite() && len > 0.0) {
                return Err(SimError::InvalidTopology { edge: e, reason: "zero or non-finite rest length" });
            }

            rest_lengths.insert(key, len);
            canonical_edges.push(key);
            adjacency[a].push(b);
            adjacency[b].push(a);

            log::trace!("added edge ({a}, {b}), len={len}");
        }

        Ok(Self {
            num_particles: n,
            edges: canonical_edges,
            rest_lengths,
            adjacency,
        })
    }

    /// Rest length of the spring between `i` and `j`, in either order.
    pub fn rest_length(&self, i: usize, j: usize) -> Result<f64, SimError> {
        let len = *self
            .rest_lengths
            .get(&canonical(i, j))
            .ok_or(SimError::UnknownEdge { i, j })?;
        debug_assert!(len > 0.0, "zero rest length stored for ({i},{j})");
        Ok(len)
    }

    /// Particles connected to `i`.  Empty for isolated or out-of-range indices.
    pub fn neighbors(&self, i: usize) -> &[usize] {
        self.adjacency.get(i).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, i: usize, j: usize) -> bool {
        self.rest_lengths.contains_key(&canonical(i, j))
    }

    /// Canonical `(min, max)` edges in the order they were supplied.
    pub fn edges(&self) -> &[(usize, usize)] {
        &self.edges
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_particles(&self) -> usize {
        self.num_particles
    }
}
