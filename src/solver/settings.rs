use serde::{Deserialize, Serialize};

/// Parameters of the preconditioned GMRES solves performed by an
/// [`EquilibriumSolver`](super::EquilibriumSolver).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverSettings<T> {
    /// Relative residual tolerance, `||b - A x|| <= tolerance * ||b||`.
    pub tolerance: T,
    /// Number of GMRES iterations between restarts.
    pub restart: usize,
    /// Maximum total number of GMRES iterations per solve.
    ///
    /// If `None`, ten times the state dimension is used.
    pub max_iterations: Option<usize>,
    /// Relative magnitude below which entries are dropped from the incomplete LU factors.
    pub drop_tolerance: T,
}

impl Default for SolverSettings<f64> {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            restart: 200,
            max_iterations: None,
            drop_tolerance: 1e-12,
        }
    }
}

impl<T> SolverSettings<T> {
    /// The iteration cap for a system with `dim` unknowns.
    pub fn max_iterations_for(&self, dim: usize) -> usize {
        self.max_iterations.unwrap_or(10 * dim)
    }
}
