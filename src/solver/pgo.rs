//! Pose graph optimization: nonlinear least squares over node positions
//!
//! Minimizes `Σ ||(p[to] − p[from]) − d||²` over all node positions with a
//! Levenberg-Marquardt iteration. Every node is free, anchors included;
//! gauge freedom is removed afterwards (see [`crate::solver::gauge`]). The
//! solve is a pure function of its inputs.

use crate::core::{Edge, Node};
use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Solver tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Hard cap on LM iterations; doubles as the per-tick time bound.
    pub iteration_cap: usize,
    /// Terminate when the gradient norm falls below this.
    pub gradient_tolerance: f64,
    /// Terminate when the accepted step is this small relative to the state.
    pub step_tolerance: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            iteration_cap: 200,
            gradient_tolerance: 1e-8,
            step_tolerance: 1e-10,
        }
    }
}

/// Result of one solve.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub positions: HashMap<Node, Vector3<f64>>,
    pub iterations: usize,
    /// Euclidean norm of the final residual vector (cm).
    pub residual_norm: f64,
    pub converged: bool,
}

/// Failures that abort a solve outright.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveError {
    /// No edges to constrain anything.
    NoEdges,
    /// An edge references a node that is not part of the problem.
    UnknownNode { node: Node },
    /// A node has no initial position.
    MissingSeed { node: Node },
    /// A residual or cost went non-finite.
    NumericalFailure { details: String },
}

impl fmt::Display for SolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveError::NoEdges => write!(f, "edge set is empty"),
            SolveError::UnknownNode { node } => {
                write!(f, "edge references unknown node {}", node)
            }
            SolveError::MissingSeed { node } => write!(f, "node {} has no seed position", node),
            SolveError::NumericalFailure { details } => {
                write!(f, "numerical failure: {}", details)
            }
        }
    }
}

impl std::error::Error for SolveError {}

/// Solve the pose graph for `nodes` given `edges` and per-node seed
/// positions. Seeds steer the gauge-free directions; a warm start changes
/// the iteration count, not the optimum.
pub fn solve(
    nodes: &[Node],
    edges: &[Edge],
    seeds: &HashMap<Node, Vector3<f64>>,
    settings: &SolverSettings,
) -> Result<SolveOutcome, SolveError> {
    if edges.is_empty() {
        return Err(SolveError::NoEdges);
    }

    let index: HashMap<Node, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, &node)| (node, i))
        .collect();

    for edge in edges {
        for node in [edge.from, edge.to] {
            if !index.contains_key(&node) {
                return Err(SolveError::UnknownNode { node });
            }
        }
    }

    let mut state = DVector::zeros(nodes.len() * 3);
    for (i, node) in nodes.iter().enumerate() {
        let seed = seeds
            .get(node)
            .ok_or(SolveError::MissingSeed { node: *node })?;
        state.rows_mut(i * 3, 3).copy_from(seed);
    }

    let (mut residuals, mut jacobian) = residuals_and_jacobian(&state, edges, &index);
    let mut cost = residuals.norm_squared();
    if !cost.is_finite() {
        return Err(SolveError::NumericalFailure {
            details: "non-finite initial residual".to_string(),
        });
    }

    let mut lambda = 1e-3;
    let mut nu = 2.0;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < settings.iteration_cap {
        iterations += 1;

        let gradient = jacobian.transpose() * &residuals;
        if gradient.norm() < settings.gradient_tolerance {
            converged = true;
            break;
        }

        let jt_j = jacobian.transpose() * &jacobian;
        let mut damped = jt_j.clone();
        for i in 0..damped.nrows() {
            // Scale-aware damping keeps the gauge null space solvable.
            damped[(i, i)] += lambda * jt_j[(i, i)].abs().max(1.0);
        }

        let step = match damped.svd(true, true).solve(&(-&gradient), 1e-12) {
            Ok(step) => step,
            Err(_) => {
                lambda = (lambda * nu).min(1e10);
                continue;
            }
        };

        if step.norm() < settings.step_tolerance * (1.0 + state.norm()) {
            converged = true;
            break;
        }

        let candidate = &state + &step;
        let (candidate_residuals, candidate_jacobian) =
            residuals_and_jacobian(&candidate, edges, &index);
        let candidate_cost = candidate_residuals.norm_squared();
        if !candidate_cost.is_finite() {
            return Err(SolveError::NumericalFailure {
                details: "non-finite residual during iteration".to_string(),
            });
        }

        let predicted_cost = (&residuals + &jacobian * &step).norm_squared();
        let predicted_reduction = cost - predicted_cost;
        let actual_reduction = cost - candidate_cost;
        let gain_ratio = if predicted_reduction.abs() > 1e-15 {
            actual_reduction / predicted_reduction
        } else {
            0.0
        };

        if actual_reduction > 0.0 && gain_ratio > 0.0 {
            state = candidate;
            residuals = candidate_residuals;
            jacobian = candidate_jacobian;
            cost = candidate_cost;

            if gain_ratio > 0.75 {
                lambda = (lambda / 3.0).max(1e-12);
            }
            nu = 2.0;
        } else {
            lambda = (lambda * nu).min(1e10);
            nu = (nu * 2.0).min(64.0);
            if lambda >= 1e10 {
                break;
            }
        }
    }

    let mut positions = HashMap::with_capacity(nodes.len());
    for (i, &node) in nodes.iter().enumerate() {
        positions.insert(
            node,
            Vector3::new(state[i * 3], state[i * 3 + 1], state[i * 3 + 2]),
        );
    }

    Ok(SolveOutcome {
        positions,
        iterations,
        residual_norm: cost.sqrt(),
        converged,
    })
}

/// Stacked residuals and the sparse block Jacobian: for edge `(u, v, d)` the
/// residual rows are `(p[v] − p[u]) − d`, differentiating to `+I` at `v` and
/// `−I` at `u`.
fn residuals_and_jacobian(
    state: &DVector<f64>,
    edges: &[Edge],
    index: &HashMap<Node, usize>,
) -> (DVector<f64>, DMatrix<f64>) {
    let mut residuals = DVector::zeros(edges.len() * 3);
    let mut jacobian = DMatrix::zeros(edges.len() * 3, state.len());

    for (k, edge) in edges.iter().enumerate() {
        let from = index[&edge.from] * 3;
        let to = index[&edge.to] * 3;

        for axis in 0..3 {
            let row = k * 3 + axis;
            residuals[row] = state[to + axis] - state[from + axis] - edge.vector[axis];
            jacobian[(row, to + axis)] = 1.0;
            jacobian[(row, from + axis)] = -1.0;
        }
    }

    (residuals, jacobian)
}
