//! Implicit linear-elastic equilibrium solves with adjoint sensitivities for 2D SIMP
//! topology optimization.
//!
//! The central type is [`EquilibriumSolver`](solver::EquilibriumSolver), which owns a sparse
//! stiffness matrix over a fixed sparsity pattern, an incomplete LU preconditioner and a
//! restarted GMRES solver, and provides forward solves, transposed (adjoint) solves and the
//! partial derivatives of the equilibrium residual `R(x, u) = K(x) u - f`.
pub mod assembly;
pub mod element;
pub mod materials;
pub mod mesh;
pub mod quadrature;
pub mod simp;
pub mod solver;

#[cfg(feature = "proptest")]
pub mod proptest;

pub extern crate fem2d_sparse as sparse;
pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

pub use fem2d_sparse::Real;
